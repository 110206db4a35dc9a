//! Tests for the resolve, cache and invoke pipeline with mock drivers.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;

use crate::builder;
use crate::cache;
use crate::config::EntryConfig;
use crate::core;
use crate::core::Core;
use crate::driver::Constructor;
use crate::driver::Driver;
use crate::driver::DriverLoader;
use crate::driver::constructor;
use crate::equality::fast_key;
use crate::factory::DRIVER_CATEGORY;
use crate::factory::Factory;
use crate::identity::ServiceIdentity;
use crate::mock_driver::FnDriver;
use crate::mock_driver::MockRegistry;
use crate::repository;
use crate::runtime::DriverRef;
use crate::runtime::ProviderInfo;
use crate::runtime::ServiceEntry;
use crate::runtime::ServiceRuntime;

fn echo() -> Constructor {
    constructor(|_| Ok(Arc::new(FnDriver::echo()) as Arc<dyn Driver>))
}

/// A driver answering every call with `value`.
fn constant(value: Value) -> Constructor {
    constructor(move |_| {
        let value = value.clone();
        Ok(Arc::new(FnDriver::new(move |_, _| Ok(value.clone()))) as Arc<dyn Driver>)
    })
}

fn registry_entry(driver: &str) -> EntryConfig {
    EntryConfig::new(ProviderInfo::with_driver(driver))
}

fn orders(name: &str) -> ServiceIdentity {
    ServiceIdentity::new("shop", "/orders", name)
}

fn descriptor(name: &str, version: &str, expire: Option<i64>) -> Value {
    json!({
        "identity": { "application": "shop", "module": "/orders", "name": name, "version": version },
        "entries": [{
            "type": "dedicated",
            "providerInfo": { "protocol": "http", "host": "orders.local", "driver": "echo" }
        }],
        "expireInSeconds": expire,
    })
}

/// A core whose single registry entry is `registry`, with `echo` registered.
fn core_over(registry: &MockRegistry) -> Core {
    let factory = Arc::new(Factory::new());
    factory.register_class("mock-registry", registry.constructor(), DRIVER_CATEGORY);
    factory.register_class("echo", echo(), DRIVER_CATEGORY);
    Core::builder()
        .entry(registry_entry("mock-registry"))
        .factory(factory)
        .build()
        .unwrap()
}

// --- Instance Registry ---

#[test]
fn test_instances_are_memoized_by_loose_settings() {
    let factory = Factory::new();
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    factory.register_class(
        "echo",
        constructor(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FnDriver::echo()) as Arc<dyn Driver>)
        }),
        DRIVER_CATEGORY,
    );

    let a = factory
        .get_instance("echo", &json!({ "host": "h", "port": 80 }), DRIVER_CATEGORY, "")
        .unwrap();
    let b = factory
        .get_instance("echo", &json!({ "port": "80", "host": "h", "tls": null }), DRIVER_CATEGORY, "")
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(built.load(Ordering::SeqCst), 1);

    let c = factory
        .get_instance("echo", &json!({ "host": "h", "port": 81 }), DRIVER_CATEGORY, "")
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(factory.instance_count(DRIVER_CATEGORY), 2);
}

#[test]
fn test_categories_are_independent() {
    let factory = Factory::new();
    factory.register_class("echo", echo(), DRIVER_CATEGORY);

    assert!(factory.lookup_class("echo", "unknown").is_none());
    assert!(factory.get_instance("echo", &json!({}), "unknown", "").is_err());
    assert!(factory.get_instance("echo", &json!({}), DRIVER_CATEGORY, "").is_ok());
}

#[test]
fn test_fast_key_bypasses_class_resolution() {
    let factory = Factory::new();
    factory.register_class("echo", echo(), DRIVER_CATEGORY);

    let a = factory
        .get_instance("echo", &json!({ "host": "h" }), DRIVER_CATEGORY, "k1")
        .unwrap();
    let b = factory
        .get_instance("never-registered", &json!({}), DRIVER_CATEGORY, "k1")
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(factory.get_instance("never-registered", &json!({}), DRIVER_CATEGORY, "k2").is_err());
}

#[test]
fn test_same_values_under_other_keys_get_their_own_instance() {
    let factory = Factory::new();
    factory.register_class("echo", echo(), DRIVER_CATEGORY);

    let by_host = json!({ "driver": "echo", "host": "h" });
    let by_zone = json!({ "driver": "echo", "zone": "h" });
    let a = factory
        .get_instance("echo", &by_host, DRIVER_CATEGORY, &fast_key(&by_host))
        .unwrap();
    let b = factory
        .get_instance("echo", &by_zone, DRIVER_CATEGORY, &fast_key(&by_zone))
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(factory.instance_count(DRIVER_CATEGORY), 2);
}

#[test]
fn test_empty_name_is_never_registered() {
    let factory = Factory::new();
    factory.register_class("", echo(), DRIVER_CATEGORY);
    assert!(factory.lookup_class("", DRIVER_CATEGORY).is_none());
}

#[tokio::test]
async fn test_later_registration_wins_without_touching_old_instances() {
    let factory = Factory::new();
    let settings = json!({ "host": "h" });
    let service = ServiceRuntime::default();

    factory.register_class("svc", constant(json!("first")), DRIVER_CATEGORY);
    let old = factory.get_instance("svc", &settings, DRIVER_CATEGORY, "").unwrap();

    factory.register_class("svc", constant(json!("second")), DRIVER_CATEGORY);
    let ctor = factory.lookup_class("svc", DRIVER_CATEGORY).unwrap();
    let fresh = ctor(&settings).unwrap();
    assert_eq!(fresh.invoke_service(&service, &[]).await.unwrap(), json!("second"));

    let same = factory.get_instance("svc", &settings, DRIVER_CATEGORY, "").unwrap();
    assert!(Arc::ptr_eq(&old, &same));
    assert_eq!(same.invoke_service(&service, &[]).await.unwrap(), json!("first"));

    let other = factory
        .get_instance("svc", &json!({ "host": "g" }), DRIVER_CATEGORY, "")
        .unwrap();
    assert_eq!(other.invoke_service(&service, &[]).await.unwrap(), json!("second"));
}

#[tokio::test]
async fn test_exec_on_all_instances_is_best_effort() {
    let factory = Factory::new();
    let closed = Arc::new(AtomicUsize::new(0));

    let counter = closed.clone();
    let closable = constructor(move |_| {
        let counter = counter.clone();
        let driver = FnDriver::echo().with_method("close", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        Ok(Arc::new(driver) as Arc<dyn Driver>)
    });
    let broken = constructor(|_| {
        let driver = FnDriver::echo().with_method("close", |_| anyhow::bail!("already closed"));
        Ok(Arc::new(driver) as Arc<dyn Driver>)
    });

    factory.get_instance(closable.clone(), &json!({ "n": 1 }), DRIVER_CATEGORY, "").unwrap();
    factory.get_instance(closable, &json!({ "n": 2 }), DRIVER_CATEGORY, "").unwrap();
    factory.get_instance(broken, &json!({ "n": 3 }), DRIVER_CATEGORY, "").unwrap();
    factory.get_instance(echo(), &json!({ "n": 4 }), DRIVER_CATEGORY, "").unwrap();

    let handled = factory.exec_on_all_instances(DRIVER_CATEGORY, "close", &[]).await;
    assert_eq!(handled, 3);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert_eq!(factory.exec_on_all_instances("empty", "close", &[]).await, 0);
}

// --- Runtime Cache ---

#[tokio::test(start_paused = true)]
async fn test_wildcard_scenario_expires_after_a_minute() {
    let registry = MockRegistry::new().with_runtime(&orders("create"), descriptor("create", "1.2.0", Some(60)));
    let core = core_over(&registry);
    let wildcard = orders("create").with_version("*");

    let first = core.cache().get_service(&wildcard).await.unwrap();
    assert_eq!(first.runtime.version(), "1.2.0");

    let via_wildcard = core.cache().lookup(&wildcard).unwrap();
    let via_version = core.cache().lookup(&orders("create").with_version("1.2.0")).unwrap();
    assert!(Arc::ptr_eq(&via_wildcard, &via_version));
    assert!(Arc::ptr_eq(&first, &via_version));

    core.cache().get_service(&wildcard).await.unwrap();
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let second = core.cache().get_service(&wildcard).await.unwrap();
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 2);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_expired());
}

#[tokio::test]
async fn test_wildcard_follows_the_highest_version() {
    let mut registry = MockRegistry::new();
    for version in ["1.0.0", "2.0.0", "1.10.0"] {
        registry = registry.with_runtime(
            &orders("create").with_version(version),
            descriptor("create", version, None),
        );
    }
    let core = core_over(&registry);

    for version in ["1.0.0", "2.0.0", "1.10.0"] {
        core.cache()
            .get_service(&orders("create").with_version(version))
            .await
            .unwrap();
    }

    let latest = core.cache().get_service(&orders("create")).await.unwrap();
    assert_eq!(latest.runtime.version(), "2.0.0");
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 3);
    assert_eq!(core.cache().versions(&orders("create")), vec!["1.0.0", "1.10.0", "2.0.0"]);
}

#[tokio::test]
async fn test_versions_of_one_service_do_not_interfere() {
    let registry = MockRegistry::new()
        .with_runtime(&orders("create").with_version("1.0.0"), descriptor("create", "1.0.0", None))
        .with_runtime(&orders("create").with_version("2.0.0"), descriptor("create", "2.0.0", None));
    let core = core_over(&registry);

    let v1 = core
        .cache()
        .get_service(&orders("create").with_version("1.0.0"))
        .await
        .unwrap();
    core.cache()
        .get_service(&orders("create").with_version("2.0.0"))
        .await
        .unwrap();

    let still_v1 = core.cache().lookup(&orders("create").with_version("1.0.0")).unwrap();
    assert!(Arc::ptr_eq(&v1, &still_v1));
    assert!(core.cache().lookup(&orders("cancel").with_version("1.0.0")).is_none());
}

#[tokio::test]
async fn test_invalid_descriptor_is_never_cached() {
    let broken = json!({
        "identity": { "application": "shop", "module": "/orders", "name": "broken", "version": "1.0.0" },
        "entries": [{ "type": "dedicated", "providerInfo": { "host": "orders.local" } }],
    });
    let identity = orders("broken").with_version("1.0.0");
    let registry = MockRegistry::new().with_runtime(&identity, broken);
    let core = core_over(&registry);

    for _ in 0..2 {
        let err = core.cache().get_service(&identity).await.unwrap_err();
        assert!(matches!(err, cache::Error::InvalidRuntimeDescriptor { .. }), "{}", err);
        assert!(core.cache().lookup(&identity).is_none());
        assert!(core.cache().lookup(&orders("broken")).is_none());
    }
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 2);
}

#[tokio::test]
async fn test_missing_runtime_and_bad_identity() {
    let registry = MockRegistry::new();
    let core = core_over(&registry);

    let err = core.cache().get_service(&orders("nowhere")).await.unwrap_err();
    assert!(matches!(err, cache::Error::ServiceRuntimeNotFound { cause: None, .. }));
    assert!(err.to_string().contains("shop:/orders:nowhere"));

    let err = core
        .cache()
        .get_service(&ServiceIdentity::new("shop", "", "create"))
        .await
        .unwrap_err();
    assert!(matches!(err, cache::Error::InvalidIdentity(_)));
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 1);
}

#[tokio::test]
async fn test_registry_failure_is_reported_as_not_found_with_cause() {
    let registry = MockRegistry::new();
    registry.fail_with(Some("connection refused"));
    let core = core_over(&registry);

    let err = core.cache().get_service(&orders("create")).await.unwrap_err();
    match err {
        cache::Error::ServiceRuntimeNotFound { cause: Some(cause), .. } => {
            assert!(matches!(cause, repository::Error::AllEntriesFailed { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_none_write_clears_the_requested_slot() {
    let registry = MockRegistry::new();
    let core = core_over(&registry);
    let runtime: ServiceRuntime = serde_json::from_value(descriptor("create", "1.0.0", None)).unwrap();
    let cached = Arc::new(cache::CachedRuntime::new(
        runtime,
        core.cache().config(),
        tokio::time::Instant::now(),
    ));

    core.cache().set_service_cache(&orders("create"), Some(cached));
    assert!(core.cache().lookup(&orders("create")).is_some());

    core.cache().set_service_cache(&orders("create"), None);
    assert!(core.cache().lookup(&orders("create")).is_none());
    assert!(core.cache().lookup(&orders("create").with_version("1.0.0")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_huge_expiry_is_cached_forever() {
    let registry = MockRegistry::new().with_runtime(&orders("create"), descriptor("create", "1.0.0", Some(i64::MAX)));
    let core = core_over(&registry);

    let cached = core.cache().get_service(&orders("create")).await.unwrap();
    assert_eq!(cached.expire_time, None);

    tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
    core.cache().get_service(&orders("create")).await.unwrap();
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_drops_an_expired_maximum() {
    let registry = MockRegistry::new()
        .with_runtime(&orders("create").with_version("1.0.0"), descriptor("create", "1.0.0", None))
        .with_runtime(&orders("create").with_version("2.0.0"), descriptor("create", "2.0.0", Some(60)))
        .with_runtime(&orders("create"), descriptor("create", "1.0.0", None));
    let core = core_over(&registry);

    for version in ["1.0.0", "2.0.0"] {
        core.cache()
            .get_service(&orders("create").with_version(version))
            .await
            .unwrap();
    }
    assert_eq!(core.cache().lookup(&orders("create")).unwrap().runtime.version(), "2.0.0");

    tokio::time::advance(Duration::from_secs(61)).await;
    let latest = core.cache().get_service(&orders("create")).await.unwrap();
    assert_eq!(latest.runtime.version(), "1.0.0");

    let wildcard = core.cache().lookup(&orders("create")).unwrap();
    assert_eq!(wildcard.runtime.version(), "1.0.0");
    assert!(core.cache().lookup(&orders("create").with_version("2.0.0")).is_none());
    assert_eq!(core.cache().versions(&orders("create")), vec!["1.0.0"]);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_is_cleared_when_its_only_version_expires() {
    let registry = MockRegistry::new()
        .with_runtime(&orders("create").with_version("2.0.0"), descriptor("create", "2.0.0", Some(60)));
    let core = core_over(&registry);

    core.cache()
        .get_service(&orders("create").with_version("2.0.0"))
        .await
        .unwrap();
    assert!(core.cache().lookup(&orders("create")).is_some());

    tokio::time::advance(Duration::from_secs(61)).await;
    let err = core.cache().get_service(&orders("create")).await.unwrap_err();
    assert!(matches!(err, cache::Error::ServiceRuntimeNotFound { cause: None, .. }));

    assert!(core.cache().lookup(&orders("create")).is_none());
    assert!(core.cache().versions(&orders("create")).is_empty());
}

// --- Repository Client ---

fn stack_order(entries: &[repository::RepositoryEntry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.provider_info.driver.as_ref())
        .filter_map(|d| d.resolve("native").map(str::to_string))
        .collect()
}

fn three_registries() -> (Core, [MockRegistry; 3]) {
    let registries = [MockRegistry::new(), MockRegistry::new(), MockRegistry::new()];
    let factory = Arc::new(Factory::new());
    let names = ["reg-a", "reg-b", "reg-c"];
    for (name, registry) in names.iter().zip(&registries) {
        factory.register_class(name, registry.constructor(), DRIVER_CATEGORY);
    }
    let core = Core::builder()
        .entries(names.iter().map(|n| registry_entry(n)))
        .factory(factory)
        .build()
        .unwrap();
    (core, registries)
}

#[tokio::test]
async fn test_failover_tries_last_entry_first_and_demotes_failures() {
    let (core, [a, b, c]) = three_registries();
    let repo = core.repository();
    let query = json!({ "name": "create" });

    c.fail_with(Some("connection refused"));
    repo.query_service(&query).await.unwrap();
    assert_eq!(c.count_of("signIn").await, 1);
    assert_eq!(b.count_of("queryService").await, 1);
    assert!(a.calls().await.is_empty());
    assert_eq!(stack_order(&repo.entries().await), vec!["reg-c", "reg-a", "reg-b"]);

    repo.query_service(&query).await.unwrap();
    assert_eq!(b.count_of("queryService").await, 2);
    assert_eq!(c.count_of("signIn").await, 1);

    b.fail_with(Some("connection reset"));
    repo.query_service(&query).await.unwrap();
    assert_eq!(a.count_of("queryService").await, 1);
    assert_eq!(stack_order(&repo.entries().await), vec!["reg-b", "reg-c", "reg-a"]);

    a.fail_with(Some("gone"));
    c.fail_with(None);
    repo.query_service(&query).await.unwrap();
    assert_eq!(c.count_of("queryService").await, 1);
    assert_eq!(stack_order(&repo.entries().await), vec!["reg-a", "reg-b", "reg-c"]);
}

#[tokio::test]
async fn test_all_entries_failed_carries_every_error() {
    let (core, registries) = three_registries();
    for registry in &registries {
        registry.fail_with(Some("connection refused"));
    }

    let err = core.repository().query_service(&json!({})).await.unwrap_err();
    match err {
        repository::Error::AllEntriesFailed { action, errors } => {
            assert_eq!(action, repository::Action::QueryService);
            assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
            for failure in errors.values() {
                assert!(matches!(failure.error, repository::Error::Transport { .. }));
            }
        }
        other => panic!("unexpected error: {}", other),
    }

    // Failed entries are demoted, never removed.
    assert_eq!(
        stack_order(&core.repository().entries().await),
        vec!["reg-c", "reg-b", "reg-a"]
    );
}

#[tokio::test]
async fn test_unavailable_entry_is_not_retried() {
    let registry = MockRegistry::new();
    registry.fail_with(Some("Method Not Allowed"));
    let core = core_over(&registry);

    let err = core.repository().sign_in().await.unwrap_err();
    let repository::Error::AllEntriesFailed { errors, .. } = err else {
        panic!("expected AllEntriesFailed");
    };
    assert!(matches!(errors[&0].error, repository::Error::ServiceUnavailable { .. }));
    assert_eq!(registry.calls().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reauthentication_is_bounded_and_jittered() {
    let registry = MockRegistry::new();
    registry.expire_tokens(true);
    let core = core_over(&registry);

    let err = core.repository().query_service(&json!({})).await.unwrap_err();
    let repository::Error::AllEntriesFailed { errors, .. } = err else {
        panic!("expected AllEntriesFailed");
    };
    assert!(matches!(errors[&0].error, repository::Error::AuthExpired { .. }));

    // One initial sign-in, then one per admitted retry.
    let sign_ins = registry.times_of("signIn").await;
    assert_eq!(sign_ins.len(), 4);
    for pair in sign_ins.windows(2) {
        let delay = pair[1] - pair[0];
        assert!(delay >= Duration::from_millis(100), "{:?}", delay);
        assert!(delay <= Duration::from_millis(600), "{:?}", delay);
    }
    assert_eq!(registry.count_of("queryService").await, 4);

    // The budget stays spent for the rest of the cool-down window.
    core.repository().query_service(&json!({})).await.unwrap_err();
    assert_eq!(registry.count_of("signIn").await, 4);

    tokio::time::advance(Duration::from_secs(61)).await;
    registry.expire_tokens(false);
    core.repository().query_service(&json!({})).await.unwrap();
}

#[tokio::test]
async fn test_reauthentication_recovers_the_action() {
    let registry = MockRegistry::new().respond("queryService", json!({ "found": true }));
    let core = core_over(&registry);
    let repo = core.repository();

    repo.sign_in().await.unwrap();
    registry.expire_tokens(true);
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.expire_tokens(false);
        })
    };

    let found = repo.query_service(&json!({ "name": "create" })).await.unwrap();
    pending.await.unwrap();
    assert_eq!(found, json!({ "found": true }));
    assert_eq!(registry.count_of("signIn").await, 2);
}

#[tokio::test]
async fn test_sign_in_and_sign_up_manage_the_session() {
    let registry = MockRegistry::new();
    let core = core_over(&registry);
    let repo = core.repository();

    repo.create_user("bob", "secret").await.unwrap();

    let calls = registry.calls().await;
    assert_eq!(calls[0].action, "signIn");
    assert_eq!(calls[0].args, vec![json!({ "name": "anonymous" }), json!("anonymous")]);
    assert_eq!(calls[1].action, "signUp");
    assert_eq!(calls[1].args, vec![json!("bob"), json!("secret"), json!("token-1")]);

    let entries = repo.entries().await;
    assert_eq!(entries[0].user, "bob");
    assert!(entries[0].has_token);

    repo.sign_out().await.unwrap();
    assert!(!repo.entries().await[0].has_token);
    let calls = registry.calls().await;
    assert_eq!(calls[2].args, vec![json!("token-2")]);
}

#[tokio::test]
async fn test_typed_helpers_send_their_payload() {
    let registry = MockRegistry::new().respond("deployServices", json!("queued"));
    let core = core_over(&registry);
    let repo = core.repository();
    let source = json!({ "type": "git", "url": "https://example.com/shop.git" });

    repo.create_or_update_source(&source).await.unwrap();
    repo.delete_application(&json!({ "name": "shop" })).await.unwrap();
    let deployed = repo.deploy_services(&json!({ "hosts": ["a"] })).await.unwrap();
    assert_eq!(deployed, json!("queued"));

    let calls = registry.calls().await;
    let actions: Vec<&str> = calls.iter().map(|c| c.action.as_str()).collect();
    assert_eq!(
        actions,
        vec!["signIn", "createOrUpdateSource", "deleteApplication", "deployServices"]
    );
    assert_eq!(calls[1].args, vec![source, json!("token-1")]);
}

// --- Invocation Core ---

#[tokio::test]
async fn test_invoke_with_driver_skips_the_registry() {
    let registry = MockRegistry::new();
    let core = core_over(&registry);
    let mut service = ServiceRuntime::for_identity(orders("create").with_version("1.0.0"));
    service.entries.push(ServiceEntry::dedicated(ProviderInfo::with_driver("echo")));

    let out = core.invoke(&service, &[json!(42)]).await.unwrap();
    assert_eq!(out, json!({ "service": "shop:/orders:create:1.0.0", "args": [42] }));
    assert!(registry.calls().await.is_empty());
}

#[tokio::test]
async fn test_invoke_resolves_identity_through_cache() {
    let registry = MockRegistry::new().with_runtime(&orders("create"), descriptor("create", "1.2.0", Some(60)));
    let core = core_over(&registry);

    let service = ServiceRuntime::for_identity(orders("create"));
    let out = core.invoke(&service, &[json!("a")]).await.unwrap();
    assert_eq!(out["service"], json!("shop:/orders:create:1.2.0"));

    let out = core.invoke_identity(&orders("create"), &[]).await.unwrap();
    assert_eq!(out["args"], json!([]));
    assert_eq!(registry.count_of("fetchServiceRuntime").await, 1);
}

#[tokio::test]
async fn test_invoke_errors_name_their_layer() {
    let registry = MockRegistry::new();
    let core = core_over(&registry);
    core.factory().register_class(
        "failing",
        constructor(|_| {
            Ok(Arc::new(FnDriver::new(|_, _| anyhow::bail!("provider down"))) as Arc<dyn Driver>)
        }),
        DRIVER_CATEGORY,
    );

    let with_driver = |driver: DriverRef| {
        let mut service = ServiceRuntime::for_identity(orders("create").with_version("1.0.0"));
        service.entries.push(ServiceEntry::dedicated(ProviderInfo::with_driver(driver)));
        service
    };

    let browser_only = DriverRef::PerPlatform([("browser".to_string(), "echo".to_string())].into());
    let err = core.invoke(&with_driver(browser_only), &[]).await.unwrap_err();
    assert!(matches!(err, core::Error::UnsupportedDriver { .. }));
    assert_eq!(err.layer(), "core");

    let err = core.invoke(&with_driver("missing".into()), &[]).await.unwrap_err();
    assert_eq!(err.layer(), "factory");

    let err = core.invoke(&with_driver("failing".into()), &[]).await.unwrap_err();
    assert_eq!(err.layer(), "driver");
    assert!(err.to_string().contains("provider down"));

    let anonymous = ServiceRuntime::for_identity(ServiceIdentity::new("shop", "", ""));
    let err = core.invoke(&anonymous, &[]).await.unwrap_err();
    assert!(matches!(err, core::Error::UnsupportedServiceIdentification(_)));

    let err = core.invoke_identity(&orders("nowhere"), &[]).await.unwrap_err();
    assert_eq!(err.layer(), "cache");
}

#[tokio::test]
async fn test_per_platform_driver_selection() {
    let factory = Arc::new(Factory::new());
    factory.register_class("echo", echo(), DRIVER_CATEGORY);
    let core = Core::builder().platform("browser").factory(factory).build().unwrap();

    let drivers = DriverRef::PerPlatform(
        [
            ("browser".to_string(), "echo".to_string()),
            ("native".to_string(), "grpc".to_string()),
        ]
        .into(),
    );
    let mut service = ServiceRuntime::for_identity(orders("create").with_version("1.0.0"));
    service.entries.push(ServiceEntry::dedicated(ProviderInfo::with_driver(drivers)));

    let out = core.invoke(&service, &[]).await.unwrap();
    assert_eq!(out["service"], json!("shop:/orders:create:1.0.0"));
}

struct CountingLoader {
    loads: AtomicUsize,
}

impl DriverLoader for CountingLoader {
    fn load(&self, name: &str) -> anyhow::Result<Constructor> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match name {
            "plugin-echo" => Ok(echo()),
            other => anyhow::bail!("no package named '{}'", other),
        }
    }
}

#[tokio::test]
async fn test_loader_resolves_unregistered_drivers_once() {
    let loader = Arc::new(CountingLoader {
        loads: AtomicUsize::new(0),
    });
    let core = Core::builder().loader(loader.clone()).build().unwrap();

    let mut service = ServiceRuntime::for_identity(orders("create").with_version("1.0.0"));
    service.entries.push(ServiceEntry::dedicated(ProviderInfo::with_driver("plugin-echo")));
    core.invoke(&service, &[]).await.unwrap();

    service.entries[0].provider_info = Some(ProviderInfo {
        host: Some("other".into()),
        ..ProviderInfo::with_driver("plugin-echo")
    });
    core.invoke(&service, &[]).await.unwrap();

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert!(core.factory().lookup_class("plugin-echo", DRIVER_CATEGORY).is_some());

    service.entries[0].provider_info = Some(ProviderInfo::with_driver("unknown"));
    let err = core.invoke(&service, &[]).await.unwrap_err();
    assert!(err.to_string().contains("no package named 'unknown'"));
}

#[test]
fn test_builder_rejects_loader_with_shared_factory() {
    let loader = Arc::new(CountingLoader {
        loads: AtomicUsize::new(0),
    });
    let result = Core::builder()
        .factory(Arc::new(Factory::new()))
        .loader(loader)
        .build();
    assert!(matches!(result, Err(builder::Error::LoaderWithFactory)));
}

#[tokio::test]
async fn test_core_from_config() {
    let registry = MockRegistry::new().with_runtime(&orders("create"), descriptor("create", "3.0.0", None));
    let factory = Arc::new(Factory::new());
    factory.register_class("mock-registry", registry.constructor(), DRIVER_CATEGORY);
    factory.register_class("echo", echo(), DRIVER_CATEGORY);

    let config = serde_json::from_value(json!({
        "repositoryEntries": [
            { "providerInfo": { "driver": "mock-registry" }, "user": "svc", "password": "pw" }
        ],
        "authRetry": { "maxRetries": 1 }
    }))
    .unwrap();
    let core = Core::from_config(config, factory).unwrap();

    let out = core.invoke_identity(&orders("create"), &[]).await.unwrap();
    assert_eq!(out["service"], json!("shop:/orders:create:3.0.0"));
    let calls = registry.calls().await;
    assert_eq!(calls[0].args, vec![json!({ "name": "svc" }), json!("pw")]);
}
