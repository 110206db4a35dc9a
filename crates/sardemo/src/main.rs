//! Wires a sardines core against an in-process registry and a local service
//! driver, then invokes one service through the full pipeline.
//!
//! Run with `RUST_LOG=debug` to watch sign-in, fetch and dispatch.

use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tracing::info;

use sardines::Config;
use sardines::Core;
use sardines::Driver;
use sardines::Factory;
use sardines::ServiceIdentity;
use sardines::ServiceRuntime;
use sardines::driver::constructor;
use sardines::factory::DRIVER_CATEGORY;
use sardines::mock_driver::MockRegistry;

/// Pretends to be a remote orders service.
struct OrdersDriver {
    host: String,
}

#[async_trait::async_trait]
impl Driver for OrdersDriver {
    async fn invoke_service(&self, service: &ServiceRuntime, args: &[Value]) -> anyhow::Result<Value> {
        info!("{} handling {}", self.host, service.identity);
        let items = args.first().cloned().unwrap_or(Value::Null);
        Ok(json!({ "order": 1001, "items": items, "servedBy": self.host }))
    }

    async fn exec_method(&self, method: &str, _params: &[Value]) -> Option<anyhow::Result<Value>> {
        match method {
            "close" => {
                info!("Closing connection to {}", self.host);
                Some(Ok(Value::Null))
            }
            _ => None,
        }
    }
}

fn config() -> anyhow::Result<Config> {
    let config = serde_json::from_value(json!({
        "platform": "native",
        "repositoryEntries": [
            { "providerInfo": { "driver": "demo-registry" }, "user": "demo", "password": "demo" }
        ],
        "authRetry": { "maxRetries": 3, "coolDownSecs": 60 }
    }))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let identity = ServiceIdentity::parse("shop:/orders:create")?;
    let registry = MockRegistry::new().with_runtime(
        &ServiceIdentity::new("shop", "/orders", "create"),
        json!({
            "identity": { "application": "shop", "module": "/orders", "name": "create", "version": "1.2.0" },
            "entries": [{
                "type": "dedicated",
                "providerInfo": { "protocol": "http", "host": "orders.local", "port": 8080, "driver": "orders" }
            }],
            "expireInSeconds": 60
        }),
    );

    let factory = Arc::new(Factory::new());
    factory.register_class("demo-registry", registry.constructor(), DRIVER_CATEGORY);
    factory.register_class(
        "orders",
        constructor(|settings| {
            let host = settings["host"].as_str().unwrap_or("localhost").to_string();
            Ok(Arc::new(OrdersDriver { host }) as Arc<dyn Driver>)
        }),
        DRIVER_CATEGORY,
    );

    let core = Core::from_config(config()?, factory)?;

    let result = core.invoke_identity(&identity, &[json!(["apple", "pear"])]).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let again = core.invoke_identity(&identity, &[json!(["fig"])]).await?;
    println!("{}", serde_json::to_string_pretty(&again)?);

    info!(
        "Registry saw {} requests, {} driver instances memoized",
        registry.calls().await.len(),
        core.factory().instance_count(DRIVER_CATEGORY)
    );

    let closed = core
        .factory()
        .exec_on_all_instances(DRIVER_CATEGORY, "close", &[])
        .await;
    info!("Closed {} driver instances", closed);

    Ok(())
}
