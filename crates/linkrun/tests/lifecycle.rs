//! Connect, disconnect and reconnect behavior.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use linkrun::linkwire::Payload;
use linkrun::linkwire::PayloadType;
use linkrun::mock::DuplexTransport;
use linkrun::mock::MemoryConnector;
use linkrun::*;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

// ============================================================================
//  FIXTURES
// ============================================================================

/// Counts `stop` calls into a shared counter.
struct Tracked {
    name: &'static str,
    stops: Arc<AtomicUsize>,
}

impl Module for Tracked {
    fn name(&self) -> &str {
        self.name
    }

    fn register(registry: &mut Registry<Self>) {
        registry.method("Echo", |_, args| Ok(args.first().cloned().unwrap_or_default()));
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A second module type, so two can be mounted side by side.
struct Audit(Tracked);

impl Module for Audit {
    fn name(&self) -> &str {
        "Audit"
    }

    fn register(registry: &mut Registry<Self>) {
        registry.method("Log", |_, _| Ok(()));
    }

    fn stop(&self) {
        self.0.stop();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    nonce: u32,
}

impl PayloadType for Ping {
    const TAG: &'static str = "test.ping";
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn hub() -> Hub {
    Hub::new(HubConfig::default().verification_delay(Duration::from_millis(10)))
}

fn config() -> ClientConfig {
    ClientConfig::new("mem://hub", "c-1")
        .name("client")
        .reconnect_delay(Duration::from_millis(20))
}

async fn next_event(events: &mut broadcast::Receiver<EndpointEvent>) -> EndpointEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel open")
}

async fn next_verified(events: &mut broadcast::Receiver<EndpointEvent>) -> Endpoint {
    loop {
        if let EndpointEvent::Verified(endpoint) = next_event(events).await {
            return endpoint;
        }
    }
}

async fn next_disconnected(events: &mut broadcast::Receiver<EndpointEvent>) -> (Endpoint, DisconnectReason) {
    loop {
        if let EndpointEvent::Disconnected(endpoint, reason) = next_event(events).await {
            return (endpoint, reason);
        }
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was never met");
}

// ============================================================================
//  DISCONNECT
// ============================================================================

#[tokio::test]
async fn test_disconnect_stops_modules_and_clears_tables() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();
    let client = Client::builder(config(), MemoryConnector::new(hub.clone()))
        .build()
        .expect("client");
    let mut events = client.subscribe();

    let local = client.connect().await.expect("connect");
    let remote = next_verified(&mut hub_events).await;

    let stops = Arc::new(AtomicUsize::new(0));
    let tracked = local
        .mount(Tracked { name: "Tracked", stops: stops.clone() })
        .expect("mount tracked");
    let audit = local
        .mount(Audit(Tracked { name: "Audit", stops: stops.clone() }))
        .expect("mount audit");

    // Nothing on the hub answers these, so they stay pending.
    let callbacks = Arc::new(AtomicUsize::new(0));
    for nonce in 0..3 {
        let seen = callbacks.clone();
        local
            .requests()
            .send(Payload::pack(&Ping { nonce }).expect("pack"), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("send");
    }
    let seen = callbacks.clone();
    tracked
        .invoke_with("Echo", vec![1.into()], true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("invoke");
    let seen = callbacks.clone();
    audit
        .invoke_with("Log", vec![], true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("invoke");
    local.listeners().on_event::<Ping, _>(|_| {});

    eventually(|| local.requests().pending_len() == 3).await;

    remote.disconnect(DisconnectReason::Requested).await;
    let (closed, reason) = next_disconnected(&mut events).await;

    assert!(closed.ptr_eq(&local));
    assert_eq!(reason, DisconnectReason::Remote);
    assert!(local.is_closed());
    assert_eq!(stops.load(Ordering::SeqCst), 2, "each module stops exactly once");
    assert!(local.module_names().is_empty());
    assert_eq!(tracked.pending_invocations(), 0);
    assert_eq!(audit.pending_invocations(), 0);
    assert_eq!(local.requests().pending_len(), 0);
    assert_eq!(local.requests().ids_in_use(), 0);
    assert!(local.listeners().is_empty());
    assert_eq!(callbacks.load(Ordering::SeqCst), 0, "cleared callbacks never run");
    assert!(matches!(local.emit(&Ping { nonce: 0 }), Err(Error::Disconnected)));
}

#[tokio::test(start_paused = true)]
async fn test_awaiting_calls_run_to_their_deadline_after_disconnect() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();
    let client = Client::builder(config().reconnect(false), MemoryConnector::new(hub.clone()))
        .build()
        .expect("client");

    let local = client.connect().await.expect("connect");
    let remote = next_verified(&mut hub_events).await;
    let tracked = local
        .mount(Tracked { name: "Tracked", stops: Arc::new(AtomicUsize::new(0)) })
        .expect("mount");

    let timeout = Duration::from_secs(3);
    let started = tokio::time::Instant::now();
    let request = {
        let local = local.clone();
        tokio::spawn(async move {
            local
                .requests()
                .send_awaiting(Payload::pack(&Ping { nonce: 9 }).expect("pack"), timeout)
                .await
        })
    };
    // The hub has no Tracked module, so this invocation is never answered.
    let invocation = {
        let tracked = tracked.clone();
        tokio::spawn(async move { tracked.invoke_awaiting("Echo", timeout, vec![1.into()]).await })
    };
    eventually(|| local.requests().pending_len() == 1 && tracked.pending_invocations() == 1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.disconnect(DisconnectReason::Requested).await;
    local.closed().await;
    assert!(!request.is_finished(), "disconnect must not complete the wait");
    assert!(!invocation.is_finished(), "disconnect must not complete the wait");

    let outcome = request.await.expect("task");
    assert!(matches!(outcome, Err(Error::Timeout)));
    let outcome = invocation.await.expect("task");
    assert!(matches!(outcome, Err(Error::Timeout)));

    let elapsed = started.elapsed();
    assert!(elapsed >= timeout, "resolved early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(100), "resolved late after {:?}", elapsed);
}

#[tokio::test]
async fn test_local_disconnect_reports_requested() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();
    let client = Client::builder(config().reconnect(false), MemoryConnector::new(hub.clone()))
        .build()
        .expect("client");
    let mut events = client.subscribe();

    let local = client.connect().await.expect("connect");
    next_verified(&mut hub_events).await;

    local.disconnect(DisconnectReason::Requested).await;

    let (_, reason) = next_disconnected(&mut events).await;
    assert_eq!(reason, DisconnectReason::Requested);
    let (_, remote_reason) = next_disconnected(&mut hub_events).await;
    assert_eq!(remote_reason, DisconnectReason::Remote);

    eventually(|| hub.is_empty()).await;
    assert!(client.endpoint().is_none());
}

#[tokio::test]
async fn test_hub_stop_closes_every_endpoint() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();

    let first = Client::builder(config().reconnect(false), MemoryConnector::new(hub.clone()))
        .build()
        .expect("client");
    let second = Client::builder(
        ClientConfig::new("mem://hub", "c-2").reconnect(false),
        MemoryConnector::new(hub.clone()),
    )
    .build()
    .expect("client");

    let a = first.connect().await.expect("connect");
    let b = second.connect().await.expect("connect");
    next_verified(&mut hub_events).await;
    next_verified(&mut hub_events).await;
    assert_eq!(hub.len(), 2);

    hub.stop().await;

    assert!(hub.is_empty());
    a.closed().await;
    b.closed().await;
}

#[tokio::test]
async fn test_hub_refuses_a_token_already_in_use() {
    init_tracing();
    let hub = hub();

    let (_first, server) = DuplexTransport::pair("shared");
    let kept = hub.accept(Box::new(server)).expect("first accept");

    let (second, server) = DuplexTransport::pair("shared");
    let refused = hub.accept(Box::new(server));
    assert!(matches!(refused, Err(Error::DuplicateToken(ref token)) if token == "shared"));

    let ended = tokio::time::timeout(Duration::from_secs(5), second.recv())
        .await
        .expect("refused transport was never closed")
        .expect("recv");
    assert!(ended.is_none());

    assert_eq!(hub.len(), 1);
    assert!(hub.by_token("shared").is_some_and(|e| e.ptr_eq(&kept)));
    assert!(!kept.is_closed());

    hub.stop().await;
    assert!(kept.is_closed());
}

// ============================================================================
//  RECONNECT
// ============================================================================

#[tokio::test]
async fn test_client_reconnects_with_fresh_tables() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();
    let connector = Arc::new(MemoryConnector::new(hub.clone()));
    let stops = Arc::new(AtomicUsize::new(0));

    let mounted = stops.clone();
    let client = Client::builder(config(), connector.clone())
        .on_connect(move |endpoint| {
            endpoint
                .mount(Tracked { name: "Tracked", stops: mounted.clone() })
                .expect("mount");
        })
        .build()
        .expect("client");
    let mut events = client.subscribe();

    client.start();
    let first = next_verified(&mut events).await;
    first.requests().register::<Ping, Ping, _>(Ok);
    assert!(first.requests().has_handler(Ping::TAG));
    let remote = next_verified(&mut hub_events).await;

    remote.disconnect(DisconnectReason::Requested).await;

    let second = next_verified(&mut events).await;
    assert!(!second.ptr_eq(&first));
    assert_ne!(second.token(), first.token());
    assert!(first.is_closed());
    assert!(!second.requests().has_handler(Ping::TAG), "handlers do not survive a reconnect");
    assert_eq!(second.module_names(), vec!["Tracked".to_string()]);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(connector.attempts(), 2);
    assert!(client.endpoint().is_some_and(|e| e.ptr_eq(&second)));

    client.stop().await;
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_client_retries_failed_attempts() {
    init_tracing();
    let hub = hub();
    let connector = Arc::new(MemoryConnector::new(hub.clone()));
    connector.fail_next(2);

    let client = Client::builder(config(), connector.clone())
        .build()
        .expect("client");
    let mut events = client.subscribe();

    client.start();
    next_verified(&mut events).await;

    assert_eq!(connector.attempts(), 3);
    assert!(client.is_connected());
    client.stop().await;
}

#[tokio::test]
async fn test_client_without_reconnect_stops_after_disconnect() {
    init_tracing();
    let hub = hub();
    let mut hub_events = hub.subscribe();
    let connector = Arc::new(MemoryConnector::new(hub.clone()));

    let client = Client::builder(config().reconnect(false), connector.clone())
        .build()
        .expect("client");
    let mut events = client.subscribe();

    client.start();
    next_verified(&mut events).await;
    next_verified(&mut hub_events).await;
    assert!(client.is_running());

    hub.stop().await;

    eventually(|| !client.is_running()).await;
    assert!(client.endpoint().is_none());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let hub = hub();
    let outcome = Client::builder(ClientConfig::new("mem://hub", ""), MemoryConnector::new(hub)).build();
    assert!(matches!(outcome, Err(Error::Config(_))));
}
