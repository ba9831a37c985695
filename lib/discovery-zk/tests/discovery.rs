use async_trait::async_trait;
use discovery_core::{
    Address, BalanceSink, BalancingPolicy, DialOptions, DiscoveryError, ResolverSink, Result,
    SvcDiscoveryRegistry,
};
use discovery_zk::store::{CreateMode, Fault};
use discovery_zk::{CoordinationStore, MemoryStore, ZkClient, ZkConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::transport::channel::Change;
use tonic::transport::Endpoint;

const SERVICE_PATH: &str = "/openim/order-svc";

macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..100 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

fn config() -> ZkConfig {
    ZkConfig::builder(vec!["memory".to_string()], "openim")
        .unregister_grace(Duration::ZERO)
        .build()
        .unwrap()
}

async fn connect(store: &MemoryStore) -> ZkClient {
    ZkClient::connect_with(config(), store).await.unwrap()
}

async fn next_change(rx: &mut mpsc::Receiver<Change<String, Endpoint>>) -> String {
    let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match change {
        Change::Insert(key, _) => format!("+{}", key),
        Change::Remove(key) => format!("-{}", key),
    }
}

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<Vec<String>>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn last(&self) -> Option<Vec<String>> {
        self.updates.lock().last().cloned()
    }
}

#[async_trait]
impl ResolverSink for RecordingSink {
    async fn update_state(&self, addrs: Vec<Address>) -> Result<()> {
        self.updates
            .lock()
            .push(addrs.into_iter().map(|a| a.addr).collect());
        Ok(())
    }

    async fn report_error(&self, err: &DiscoveryError) {
        self.errors.lock().push(err.to_string());
    }
}

#[tokio::test]
async fn test_register_then_resolve_round_trip() {
    let store = MemoryStore::new();
    let client = connect(&store).await;

    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    let addrs = client.resolve_remote("order-svc").await.unwrap();
    assert_eq!(addrs, vec![Address::new("10.0.0.5:9000", "order-svc")]);
    assert_eq!(
        client.get_self_conn_target().await.as_deref(),
        Some("10.0.0.5:9000")
    );

    client.unregister().await.unwrap();
    assert!(client.resolve_remote("order-svc").await.unwrap().is_empty());
    assert!(client.registration().await.is_none());
    assert!(client.get_self_conn_target().await.is_none());
}

#[tokio::test]
async fn test_registration_node_layout() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    let node_path = client.node_path().await.unwrap();
    let name = node_path.strip_prefix("/openim/order-svc/").unwrap();
    assert!(name.starts_with("_c_"));
    let (_, sequence) = name.rsplit_once('_').unwrap();
    assert!(name.contains("-10.0.0.5:9000_"));
    assert_eq!(sequence.len(), 10);
    assert_eq!(store.get(&node_path).unwrap(), b"10.0.0.5:9000");
}

#[tokio::test]
async fn test_registration_survives_session_expiry() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    let before = client.node_path().await.unwrap();

    store.expire_session(store.sessions()[0]);
    assert!(store.children(SERVICE_PATH).unwrap().is_empty());

    eventually!(store.children(SERVICE_PATH).unwrap().len() == 1);
    let after = client.node_path().await.unwrap();
    assert_ne!(before, after);
    assert_eq!(store.get(&after).unwrap(), b"10.0.0.5:9000");
    assert_eq!(
        client.resolve_remote("order-svc").await.unwrap(),
        vec![Address::new("10.0.0.5:9000", "order-svc")]
    );
}

#[tokio::test]
async fn test_transient_disconnect_keeps_single_node() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    let before = client.node_path().await.unwrap();

    let session = store.sessions()[0];
    store.disconnect(session);
    store.reconnect(session);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.children(SERVICE_PATH).unwrap().len(), 1);
    assert_eq!(client.node_path().await.unwrap(), before);
}

#[tokio::test]
async fn test_membership_change_invalidates_cache() {
    let store = MemoryStore::new();
    let first = connect(&store).await;
    first
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    let conns = first.get_conns("order-svc", DialOptions::new()).await.unwrap();
    assert_eq!(conns.len(), 1);
    assert!(first.local_conns().await.contains_key("order-svc"));

    let second = connect(&store).await;
    second
        .register("order-svc", "10.0.0.6", 9000, DialOptions::new())
        .await
        .unwrap();

    eventually!(!first.local_conns().await.contains_key("order-svc"));
    let conns = first.get_conns("order-svc", DialOptions::new()).await.unwrap();
    assert_eq!(conns.len(), 2);
}

#[tokio::test]
async fn test_no_instance_is_distinct_from_lookup_failure() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client.create_service_nodes(&["empty-svc"]).await.unwrap();

    let err = client
        .get_conns("empty-svc", DialOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_no_instance());
    assert!(matches!(err, DiscoveryError::NoInstance { ref root, .. } if root == "/openim"));

    store.inject_fault(store.sessions()[0], Fault::ConnectionLoss);
    let err = client
        .get_conns("empty-svc", DialOptions::new())
        .await
        .unwrap_err();
    assert!(!err.is_no_instance());
    assert!(matches!(err, DiscoveryError::Node { .. }));
}

#[tokio::test]
async fn test_dial_failure_caches_nothing() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    let (raw, _events) = store.open_session();
    raw.create(
        "/openim/order-svc/bad_",
        b"bad host:1",
        CreateMode::EphemeralSequential,
    )
    .await
    .unwrap();

    let err = client
        .get_conns("order-svc", DialOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));
    assert!(client.local_conns().await.is_empty());
}

#[tokio::test]
async fn test_failed_dial_probe_writes_nothing() {
    let store = MemoryStore::new();
    let client = connect(&store).await;

    let options = DialOptions::eager().with_connect_timeout(Duration::from_millis(500));
    let err = client
        .register("order-svc", "127.0.0.1", 1, options)
        .await
        .unwrap_err();

    assert!(matches!(err, DiscoveryError::Dial { .. }));
    assert!(store.children(SERVICE_PATH).unwrap().is_empty());
    assert!(client.registration().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_unregister() {
    let store = MemoryStore::new();
    let client = Arc::new(connect(&store).await);

    let mut tasks = Vec::new();
    for i in 0..16u16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                if i % 2 == 0 {
                    client
                        .register("order-svc", "10.0.0.5", 9000 + i, DialOptions::new())
                        .await
                        .unwrap();
                } else {
                    match client.unregister().await {
                        Ok(()) | Err(DiscoveryError::NotRegistered) => {}
                        Err(e) => panic!("unexpected unregister error: {}", e),
                    }
                }
                if let Some(registration) = client.registration().await {
                    assert!(!registration.node_path.is_empty());
                }
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let children = store.children(SERVICE_PATH).unwrap();
    match client.registration().await {
        Some(registration) => {
            assert_eq!(children.len(), 1);
            assert!(registration.node_path.ends_with(&children[0]));
        }
        None => assert!(children.is_empty()),
    }
}

#[tokio::test]
async fn test_refresh_covers_suppressed_watches() {
    let store = MemoryStore::new();
    store.suppress_watches(true);
    let config = ZkConfig::builder(vec!["memory".to_string()], "openim")
        .refresh_interval(Duration::from_millis(300))
        .unregister_grace(Duration::ZERO)
        .build()
        .unwrap();
    let first = ZkClient::connect_with(config, &store).await.unwrap();
    first
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    assert_eq!(
        first.get_conns("order-svc", DialOptions::new()).await.unwrap().len(),
        1
    );

    let second = connect(&store).await;
    second
        .register("order-svc", "10.0.0.6", 9000, DialOptions::new())
        .await
        .unwrap();

    // No watch delivery, so the cached entry is still served.
    assert_eq!(
        first.get_conns("order-svc", DialOptions::new()).await.unwrap().len(),
        1
    );

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(first.local_conns().await.is_empty());
    assert_eq!(
        first.get_conns("order-svc", DialOptions::new()).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_end_to_end_two_processes() {
    let store = MemoryStore::new();
    let order_a = connect(&store).await;
    let caller = connect(&store).await;

    order_a
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    assert_eq!(
        caller.get_conns("order-svc", DialOptions::new()).await.unwrap().len(),
        1
    );

    let order_b = connect(&store).await;
    order_b
        .register("order-svc", "10.0.0.6", 9000, DialOptions::new())
        .await
        .unwrap();

    eventually!(
        caller
            .get_conns("order-svc", DialOptions::new())
            .await
            .unwrap()
            .len()
            == 2
    );

    order_b.close().await;
    eventually!(
        caller
            .get_conns("order-svc", DialOptions::new())
            .await
            .unwrap()
            .len()
            == 1
    );
}

#[tokio::test]
async fn test_resolver_follows_membership() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    let sink = Arc::new(RecordingSink::default());

    let handle = client
        .build_resolver("openim:///order-svc", sink.clone())
        .await
        .unwrap();
    assert_eq!(handle.service_name(), "order-svc");
    eventually!(sink.last() == Some(vec![]));

    let other = connect(&store).await;
    other
        .register("order-svc", "10.0.0.6", 9000, DialOptions::new())
        .await
        .unwrap();
    eventually!(sink.last() == Some(vec!["10.0.0.6:9000".to_string()]));

    handle.close();
    let seen = sink.updates.lock().len();
    other.unregister().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.updates.lock().len(), seen);
    assert!(sink.errors.lock().is_empty());
}

#[tokio::test]
async fn test_resolver_rejects_foreign_scheme() {
    let store = MemoryStore::new();
    let client = connect(&store).await;

    let err = client
        .build_resolver("dns:///order-svc", Arc::new(RecordingSink::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));
}

#[tokio::test]
async fn test_balance_sink_follows_membership() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let sink = Arc::new(BalanceSink::new(
        tx,
        BalancingPolicy::RoundRobin,
        DialOptions::new(),
    ));
    client
        .build_resolver("openim:///order-svc", sink.clone())
        .await
        .unwrap();
    assert_eq!(next_change(&mut rx).await, "+10.0.0.5:9000");

    let other = connect(&store).await;
    other
        .register("order-svc", "10.0.0.6", 9000, DialOptions::new())
        .await
        .unwrap();
    assert_eq!(next_change(&mut rx).await, "+10.0.0.6:9000");
    assert_eq!(sink.current().await, vec!["10.0.0.5:9000", "10.0.0.6:9000"]);

    other.unregister().await.unwrap();
    assert_eq!(next_change(&mut rx).await, "-10.0.0.6:9000");
}

#[tokio::test]
async fn test_get_conn_rejects_bad_service_name() {
    let store = MemoryStore::new();
    let client = connect(&store).await;

    assert!(client.get_conn("order-svc", DialOptions::new()).await.is_ok());
    assert!(client.get_conn("a/b", DialOptions::new()).await.is_err());
}

#[tokio::test]
async fn test_dropped_consumers_release_resolvers() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    // Membership stays the same, so nothing is ever sent to these sinks.
    let (tx, rx) = mpsc::channel(16);
    let sink = Arc::new(BalanceSink::new(
        tx,
        BalancingPolicy::RoundRobin,
        DialOptions::new(),
    ));
    client
        .build_resolver("openim:///order-svc", sink)
        .await
        .unwrap();
    assert_eq!(client.resolver_count().await, 1);
    drop(rx);
    eventually!(client.resolver_count().await == 0);

    for _ in 0..50 {
        let channel = client
            .get_conn("order-svc", DialOptions::new())
            .await
            .unwrap();
        drop(channel);
    }
    eventually!(client.resolver_count().await == 0);
}

#[tokio::test]
async fn test_unregister_stops_resolvers() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();

    let handle = client
        .build_resolver("openim:///order-svc", Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    client.unregister().await.unwrap();

    assert!(handle.is_closed());
    eventually!(client.resolver_count().await == 0);
}

#[tokio::test]
async fn test_registration_survives_terminated_session() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    let first = store.sessions()[0];

    store.terminate_session(first);
    assert!(store.children(SERVICE_PATH).unwrap().is_empty());

    eventually!(store.children(SERVICE_PATH).unwrap().len() == 1);
    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_ne!(sessions[0], first);
    assert_eq!(
        client.resolve_remote("order-svc").await.unwrap(),
        vec![Address::new("10.0.0.5:9000", "order-svc")]
    );

    client.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.sessions().is_empty());
}

#[tokio::test]
async fn test_unregister_requires_registration() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    assert!(matches!(
        client.unregister().await,
        Err(DiscoveryError::NotRegistered)
    ));
}

#[tokio::test]
async fn test_conf_round_trip() {
    let store = MemoryStore::new();
    let client = connect(&store).await;

    client.register_conf("app", b"v1").await.unwrap();
    assert_eq!(client.get_conf("app").await.unwrap(), b"v1");
    client.register_conf("app", b"v2").await.unwrap();
    assert_eq!(client.get_conf("app").await.unwrap(), b"v2");
    assert!(client.get_conf("missing").await.is_err());
}

#[tokio::test]
async fn test_auth_failure_is_fatal() {
    let store = MemoryStore::new();
    store.require_auth("admin", "secret");

    let config = ZkConfig::builder(vec!["memory".to_string()], "openim")
        .credentials("admin", "wrong")
        .build()
        .unwrap();
    let err = ZkClient::connect_with(config, &store).await.err().unwrap();
    assert!(matches!(err, DiscoveryError::Auth { ref username, .. } if username == "admin"));
    assert!(store.sessions().is_empty());

    let config = ZkConfig::builder(vec!["memory".to_string()], "openim")
        .credentials("admin", "secret")
        .build()
        .unwrap();
    assert!(ZkClient::connect_with(config, &store).await.is_ok());
}

#[tokio::test]
async fn test_close_surfaces_errors() {
    let store = MemoryStore::new();
    let client = connect(&store).await;
    client.close().await;

    assert!(store.sessions().is_empty());
    let err = client.resolve_remote("order-svc").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Node { .. }));
}

#[tokio::test]
async fn test_registry_behind_trait_object() {
    let store = MemoryStore::new();
    let registry: Arc<dyn SvcDiscoveryRegistry> = Arc::new(connect(&store).await);

    registry
        .register("order-svc", "10.0.0.5", 9000, DialOptions::new())
        .await
        .unwrap();
    assert_eq!(
        registry.get_self_conn_target().await.as_deref(),
        Some("10.0.0.5:9000")
    );
    assert_eq!(
        registry
            .get_conns("order-svc", DialOptions::new())
            .await
            .unwrap()
            .len(),
        1
    );

    registry.unregister().await.unwrap();
    registry.close().await;
    assert!(store.sessions().is_empty());
}
