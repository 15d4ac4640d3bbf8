//! End-to-end tests: a hub and a client talking over in-memory transports.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use linkrun::linkwire::InvokeMethod;
use linkrun::linkwire::InvokeMethodResult;
use linkrun::linkwire::Message;
use linkrun::linkwire::PayloadType;
use linkrun::linkwire::Value;
use linkrun::linkwire::VerificationResponse;
use linkrun::linkwire::code;
use linkrun::mock::DuplexTransport;
use linkrun::mock::MemoryConnector;
use linkrun::*;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

// ============================================================================
//  FIXTURES
// ============================================================================

#[derive(Default)]
struct Calc {
    scale: AtomicI64,
}

impl Module for Calc {
    fn name(&self) -> &str {
        "Calc"
    }

    fn register(registry: &mut Registry<Self>) {
        registry
            .method("Add", |_, args| Ok(arg::<i64>(args, 0)? + arg::<i64>(args, 1)?))
            .method("Divide", |_, args| {
                let (a, b) = (arg::<i64>(args, 0)?, arg::<i64>(args, 1)?);
                if b == 0 {
                    return Err(Fault::new("division by zero"));
                }
                Ok(a / b)
            })
            .property(
                "Scale",
                |calc: &Calc| calc.scale.load(Ordering::SeqCst),
                |calc: &Calc, value: i64| calc.scale.store(value, Ordering::SeqCst),
            );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    nonce: u32,
}

impl PayloadType for Ping {
    const TAG: &'static str = "test.ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    nonce: u32,
}

impl PayloadType for Pong {
    const TAG: &'static str = "test.pong";
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn hub() -> Hub {
    Hub::builder(HubConfig::default().verification_delay(Duration::from_millis(10)))
        .on_accept(|endpoint| {
            endpoint.mount(Calc::default()).expect("mount on hub");
            endpoint
                .requests()
                .register::<Ping, Pong, _>(|ping| Ok(Pong { nonce: ping.nonce + 1 }));
            endpoint
                .listeners()
                .on_event_reply::<Ping, Pong, _>(|ping| Some(Pong { nonce: ping.nonce * 10 }));
        })
        .build()
}

fn client(hub: &Hub) -> Client {
    let config = ClientConfig::new("mem://hub", "c-1").name("client").port(7777);
    Client::builder(config, MemoryConnector::new(hub.clone()))
        .on_connect(|endpoint| {
            endpoint.mount(Calc::default()).expect("mount on client");
        })
        .build()
        .expect("valid client config")
}

async fn next_verified(events: &mut broadcast::Receiver<EndpointEvent>) -> Endpoint {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for verification")
            .expect("event channel open");
        if let EndpointEvent::Verified(endpoint) = event {
            return endpoint;
        }
    }
}

/// Connects a client and waits until both sides are verified.
async fn connected(hub: &Hub) -> (Client, Endpoint, Endpoint) {
    init_tracing();
    let mut hub_events = hub.subscribe();
    let client = client(hub);
    let local = client.connect().await.expect("connect");
    let remote = next_verified(&mut hub_events).await;
    (client, local, remote)
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
//  VERIFICATION
// ============================================================================

#[tokio::test]
async fn test_handshake_verifies_both_sides() {
    let hub = hub();
    let (client, local, remote) = connected(&hub).await;

    assert_eq!(remote.identity(), Some(&Identity::new("client", "c-1", 7777)));
    assert_eq!(remote.role(), Role::Accepting);
    assert!(local.is_verified());
    assert!(client.is_connected());
    assert!(local.identity().is_none(), "only the accepting side learns an identity");

    assert!(hub.by_id("c-1").is_some_and(|e| e.ptr_eq(&remote)));
    assert!(hub.by_name("client").is_some());
    assert!(hub.by_token(remote.token()).is_some());
    assert_eq!(hub.len(), 1);
}

#[tokio::test]
async fn test_traffic_before_verification_is_dropped() {
    init_tracing();
    let hub = hub();
    let (raw, server) = DuplexTransport::pair("raw-1");
    hub.accept(Box::new(server)).expect("accept");

    let add = |id: i32| {
        linkwire_frame(InvokeMethod {
            module_code: code("Calc"),
            method_code: code("Add"),
            invocation_id: id,
            args: vec![Value::Int(2), Value::Int(3)],
        })
    };

    raw.send(&add(1)).await.expect("send early call");

    let challenge = recv_message(&raw).await;
    assert!(matches!(challenge, Message::VerificationRequest(ref r) if r.challenge_token == "raw-1"));

    raw.send(&linkwire_frame(VerificationResponse {
        name: "raw".into(),
        id: "r-1".into(),
        port: 1,
    }))
    .await
    .expect("answer challenge");
    raw.send(&add(7)).await.expect("send call");

    assert_eq!(
        recv_message(&raw).await,
        Message::from(InvokeMethodResult {
            invocation_id: 7,
            value: Some(Value::Int(5)),
            exception: None,
        })
    );
}

fn linkwire_frame(message: impl Into<Message>) -> Vec<u8> {
    linkrun::linkwire::encode(&message.into()).expect("encode")
}

async fn recv_message(transport: &DuplexTransport) -> Message {
    let frame = tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport open")
        .expect("stream not ended");
    linkrun::linkwire::decode(&frame).expect("decode")
}

// ============================================================================
//  MODULES
// ============================================================================

#[tokio::test]
async fn test_invoke_awaiting_returns_remote_result() -> anyhow::Result<()> {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;
    let calc = local
        .module::<Calc>()
        .ok_or_else(|| anyhow::anyhow!("Calc not mounted by on_connect"))?;

    let sum = calc
        .invoke_awaiting("Add", Duration::from_secs(2), vec![2.into(), 3.into()])
        .await?;
    assert_eq!(sum, Value::Int(5));

    let quotient: i64 = calc
        .call("Divide", Duration::from_secs(2), vec![9.into(), 3.into()])
        .await?;
    assert_eq!(quotient, 3);
    assert_eq!(calc.pending_invocations(), 0);
    Ok(())
}

#[tokio::test]
async fn test_remote_fault_surfaces_to_caller() {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;
    let calc = local.module::<Calc>().expect("mounted");

    let outcome = calc
        .invoke_awaiting("Divide", Duration::from_secs(2), vec![1.into(), 0.into()])
        .await;
    match outcome {
        Err(Error::Remote(fault)) => assert_eq!(fault.0, "division by zero"),
        other => panic!("expected a remote fault, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_invoke_awaiting_times_out_without_leaking() {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;
    let calc = local.module::<Calc>().expect("mounted");

    let timeout = Duration::from_secs(5);
    let started = tokio::time::Instant::now();
    let outcome = calc.invoke_awaiting("Missing", timeout, vec![]).await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(Error::Timeout)));
    assert!(elapsed >= timeout, "timed out early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(100), "timed out late after {:?}", elapsed);
    assert_eq!(calc.pending_invocations(), 0);
    assert!(!local.is_closed(), "a timeout does not affect the connection");
}

#[tokio::test]
async fn test_property_write_propagates() {
    let hub = hub();
    let (_client, local, remote) = connected(&hub).await;
    let calc = local.module::<Calc>().expect("mounted");
    let far = remote.module::<Calc>().expect("mounted on hub");

    calc.set_property("Scale", 6i64).expect("set");
    assert_eq!(calc.property::<i64>("Scale").expect("local read"), 6);

    eventually(|| far.module().scale.load(Ordering::SeqCst) == 6).await;
    assert_eq!(far.get_property("Scale").expect("remote cache"), Value::Int(6));
}

// ============================================================================
//  REQUESTS AND EVENTS
// ============================================================================

#[tokio::test]
async fn test_request_round_trip() -> anyhow::Result<()> {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;

    let pong: Pong = local.requests().get(&Ping { nonce: 1 }, Duration::from_secs(2)).await?;

    assert_eq!(pong, Pong { nonce: 2 });
    assert_eq!(local.requests().pending_len(), 0);
    assert_eq!(local.requests().ids_in_use(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unhandled_request_times_out() {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;

    let outcome = local
        .requests()
        .get::<Pong, Ping>(&Pong { nonce: 1 }, Duration::from_secs(3))
        .await;

    assert!(matches!(outcome, Err(Error::Timeout)));
    assert_eq!(local.requests().pending_len(), 0);
    assert_eq!(local.requests().ids_in_use(), 0);
}

#[tokio::test]
async fn test_event_reply_comes_back() {
    let hub = hub();
    let (_client, local, _remote) = connected(&hub).await;
    let (tx, rx) = std::sync::mpsc::channel();

    local.listeners().on_event::<Pong, _>(move |pong| {
        let _ = tx.send(pong);
    });
    local.emit(&Ping { nonce: 4 }).expect("emit");

    let mut received = None;
    eventually(|| {
        received = rx.try_recv().ok();
        received.is_some()
    })
    .await;
    assert_eq!(received, Some(Pong { nonce: 40 }));
}
