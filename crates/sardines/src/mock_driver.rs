//! Mock drivers for testing.
//!
//! These back the test suite and the demo binary. They are not meant for
//! production wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::driver::Constructor;
use crate::driver::Driver;
use crate::driver::constructor;
use crate::identity::ServiceIdentity;
use crate::runtime::ServiceRuntime;

type InvokeFn = dyn Fn(&ServiceRuntime, &[Value]) -> anyhow::Result<Value> + Send + Sync;
type MethodFn = dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync;

/// A driver backed by a closure.
pub struct FnDriver {
    invoke: Box<InvokeFn>,
    methods: HashMap<String, Box<MethodFn>>,
}

impl FnDriver {
    pub fn new<F>(invoke: F) -> Self
    where
        F: Fn(&ServiceRuntime, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            invoke: Box::new(invoke),
            methods: HashMap::new(),
        }
    }

    /// Answers every call with `{service, args}`.
    pub fn echo() -> Self {
        Self::new(|service, args| {
            Ok(json!({
                "service": service.identity.to_string(),
                "args": args,
            }))
        })
    }

    /// Exposes `name` to [`crate::factory::Factory::exec_on_all_instances`].
    pub fn with_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(f));
        self
    }
}

#[async_trait::async_trait]
impl Driver for FnDriver {
    async fn invoke_service(&self, service: &ServiceRuntime, args: &[Value]) -> anyhow::Result<Value> {
        (self.invoke)(service, args)
    }

    async fn exec_method(&self, method: &str, params: &[Value]) -> Option<anyhow::Result<Value>> {
        self.methods.get(method).map(|f| f(params))
    }
}

/// One request received by a [`MockRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryCall {
    pub action: String,
    pub args: Vec<Value>,
    pub at: Instant,
}

#[derive(Default)]
struct RegistryState {
    runtimes: DashMap<String, Value>,
    responses: DashMap<String, Value>,
    failure: std::sync::RwLock<Option<String>>,
    expire_tokens: AtomicBool,
    issued: AtomicUsize,
    calls: Mutex<Vec<RegistryCall>>,
}

/// An in-process registry reached through the driver path.
///
/// Serves runtime descriptors keyed by the identity string of the query,
/// issues a fresh token on every sign-in and records every action it
/// receives. Clones share state.
#[derive(Clone, Default)]
pub struct MockRegistry {
    state: Arc<RegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `runtime` to `fetchServiceRuntime` queries for `query`.
    pub fn with_runtime(self, query: &ServiceIdentity, runtime: Value) -> Self {
        self.state.runtimes.insert(query.to_string(), runtime);
        self
    }

    /// Answers `action` with `value` wrapped in a `{res}` envelope.
    pub fn respond(self, action: &str, value: Value) -> Self {
        self.state.responses.insert(action.to_string(), value);
        self
    }

    /// Makes every request fail with `message`, or succeed again with `None`.
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.state.failure.write() {
            *failure = message.map(str::to_string);
        }
    }

    /// Makes every request but sign-in answer `"token expired"`.
    pub fn expire_tokens(&self, on: bool) {
        self.state.expire_tokens.store(on, Ordering::SeqCst);
    }

    /// A constructor handing out this registry, whatever the settings.
    pub fn constructor(&self) -> Constructor {
        let registry = self.clone();
        constructor(move |_| Ok(Arc::new(registry.clone()) as Arc<dyn Driver>))
    }

    pub async fn calls(&self) -> Vec<RegistryCall> {
        self.state.calls.lock().await.clone()
    }

    /// Times at which `action` was received.
    pub async fn times_of(&self, action: &str) -> Vec<Instant> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.action == action)
            .map(|c| c.at)
            .collect()
    }

    pub async fn count_of(&self, action: &str) -> usize {
        self.times_of(action).await.len()
    }

    fn answer(&self, action: &str, args: &[Value]) -> anyhow::Result<Value> {
        let failure = self.state.failure.read().ok().and_then(|f| f.clone());
        if let Some(message) = failure {
            anyhow::bail!(message);
        }

        match action {
            "signIn" | "signUp" => {
                let n = self.state.issued.fetch_add(1, Ordering::SeqCst) + 1;
                return Ok(json!(format!("token-{}", n)));
            }
            _ if self.state.expire_tokens.load(Ordering::SeqCst) => {
                return Ok(json!("token expired"));
            }
            _ => {}
        }

        if action == "fetchServiceRuntime" {
            let query: ServiceIdentity = match args.first() {
                Some(value) => serde_json::from_value(value.clone())?,
                None => anyhow::bail!("missing service identity"),
            };
            let runtime = self.state.runtimes.get(&query.to_string());
            return Ok(json!({ "res": runtime.map(|r| r.value().clone()) }));
        }

        let response = self.state.responses.get(action).map(|r| r.value().clone());
        Ok(json!({ "res": response }))
    }
}

#[async_trait::async_trait]
impl Driver for MockRegistry {
    async fn invoke_service(&self, service: &ServiceRuntime, args: &[Value]) -> anyhow::Result<Value> {
        let action = service.identity.name.clone();
        self.state.calls.lock().await.push(RegistryCall {
            action: action.clone(),
            args: args.to_vec(),
            at: Instant::now(),
        });
        self.answer(&action, args)
    }
}
