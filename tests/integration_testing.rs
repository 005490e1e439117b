use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use codec::{
    ErrorKind,
    message::{Request, Response},
};
use minibus_sdk::{Client, ClientOptions};
use serde_json::json;
use tests::{RawClient, create_broker, wait_for};
use tokio::time::{sleep, timeout};

async fn connect(server: std::net::SocketAddr, name: &str) -> Client {
    Client::connect(ClientOptions {
        server,
        name: name.to_owned(),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn auth_collision_leaves_original_usable() -> Result<()> {
    let server = create_broker(25801).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    let original = connect(server, "aaa").await;
    probe.wait_registered("aaa").await?;

    // A second socket claiming the live name is rejected; its loop treats
    // the error as fatal.
    let imposter = connect(server, "aaa").await;
    timeout(Duration::from_secs(5), imposter.closed()).await?;

    // The original connection still publishes and fans out.
    probe
        .send(&Request::Subscribe {
            node: "aaa".to_owned(),
            field: "f".to_owned(),
        })
        .await?;
    probe.snapshot().await?;

    original.post("f", b"still here")?;
    match probe.read().await? {
        Response::Deliver { node, field, payload } => {
            assert_eq!((node.as_str(), field.as_str()), ("aaa", "f"));
            assert_eq!(payload.as_ref(), b"still here");
        }
        other => anyhow::bail!("expected a delivery, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn publish_before_subscribe_does_not_replay() -> Result<()> {
    let server = create_broker(25802).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    let publisher = connect(server, "pub").await;
    probe.wait_registered("pub").await?;

    publisher.post("tmp", b"hi")?;
    wait_for_snapshot(&mut probe, |snapshot| {
        snapshot.pointer("/pub/fields/tmp").is_some()
    })
    .await?;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let subscriber = connect(server, "sub").await;
    subscriber.subscribe("pub", "tmp", move |payload| {
        sink.lock().unwrap().push(payload);
    })?;

    wait_for_snapshot(&mut probe, |snapshot| {
        snapshot.pointer("/pub/fields/tmp/subscribers") == Some(&json!(["sub"]))
    })
    .await?;

    publisher.post("tmp", b"ho")?;

    let first = wait_for(|| captured.lock().unwrap().first().cloned()).await;
    assert_eq!(first.as_ref(), b"ho");

    // The pre-subscription payload is never replayed.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(captured.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn get_on_subscribed_but_unposted_field() -> Result<()> {
    let server = create_broker(25803).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    let _owner = connect(server, "pub").await;
    probe.wait_registered("pub").await?;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let subscriber = connect(server, "sub").await;
    subscriber.subscribe("pub", "newfield", move |payload| {
        sink.lock().unwrap().push(payload);
    })?;

    wait_for_snapshot(&mut probe, |snapshot| {
        snapshot.pointer("/pub/fields/newfield").is_some()
    })
    .await?;

    // Subscribing created the field without a payload; GET answers an
    // empty delivery rather than an error.
    subscriber.get("pub", "newfield")?;

    let first = wait_for(|| captured.lock().unwrap().first().cloned()).await;
    assert_eq!(first, Bytes::new());

    Ok(())
}

#[tokio::test]
async fn anon_falls_back_to_broker_relay() -> Result<()> {
    let server = create_broker(25804).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    // "y" never advertises a datagram endpoint.
    let mut y = RawClient::connect(server, "y").await?;
    probe.wait_registered("y").await?;

    let x = connect(server, "x").await;
    probe.wait_registered("x").await?;

    // First send: endpoint lookup fails, the payload still arrives via the
    // broker.
    x.anon("y", "msg", b"\x01\x02", false).await?;
    match y.read().await? {
        Response::DeliverAnon { sender, field, payload } => {
            assert_eq!((sender.as_str(), field.as_str()), ("x", "msg"));
            assert_eq!(payload.as_ref(), b"\x01\x02");
        }
        other => anyhow::bail!("expected an anon delivery, got {other:?}"),
    }

    // The miss is remembered: tried, no endpoint, not reachable.
    let peer = wait_for(|| x.peer("y").filter(|peer| peer.tried)).await;
    assert!(!peer.reachable);
    assert_eq!(peer.addr, None);

    // Subsequent sends go straight to relay.
    x.anon("y", "msg", b"\x03", false).await?;
    match y.read().await? {
        Response::DeliverAnon { payload, .. } => assert_eq!(payload.as_ref(), b"\x03"),
        other => anyhow::bail!("expected an anon delivery, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn anon_switches_to_datagram_fast_path() -> Result<()> {
    let server = create_broker(25805).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let y = connect(server, "y").await;
    y.on_anon("msg", move |payload, sender| {
        sink.lock().unwrap().push((sender, payload));
    });

    let x = connect(server, "x").await;
    probe.wait_endpoint("y").await?;
    probe.wait_endpoint("x").await?;

    // First send: lookup plus relay.
    x.anon("y", "msg", b"one", false).await?;
    wait_for(|| (captured.lock().unwrap().len() == 1).then_some(())).await;
    wait_for(|| x.peer("y").filter(|peer| peer.addr.is_some())).await;

    // Second send: the probe confirms the peer and the payload goes
    // direct, without broker involvement.
    x.anon("y", "msg", b"two", false).await?;
    wait_for(|| (captured.lock().unwrap().len() == 2).then_some(())).await;
    assert!(x.peer("y").unwrap().reachable);

    // Confirmed peers keep the fast path.
    x.anon("y", "msg", b"three", false).await?;
    wait_for(|| (captured.lock().unwrap().len() == 3).then_some(())).await;

    // force_relay pushes the same payload through the broker instead.
    x.anon("y", "msg", b"four", true).await?;
    wait_for(|| (captured.lock().unwrap().len() == 4).then_some(())).await;

    let messages = captured.lock().unwrap().clone();
    for (sender, _) in &messages {
        assert_eq!(sender, "x");
    }

    let payloads: Vec<_> = messages.iter().map(|(_, payload)| payload.as_ref()).collect();
    assert_eq!(payloads, [b"one".as_ref(), b"two", b"three", b"four"]);

    Ok(())
}

#[tokio::test]
async fn disconnect_scrubs_subscriptions() -> Result<()> {
    let server = create_broker(25806).await;
    let mut probe = RawClient::connect(server, "probe").await?;

    let publisher = connect(server, "pub").await;
    probe.wait_registered("pub").await?;

    let mut a = RawClient::connect(server, "a").await?;
    a.send(&Request::Subscribe {
        node: "pub".to_owned(),
        field: "data".to_owned(),
    })
    .await?;
    a.snapshot().await?;

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let b = connect(server, "b").await;
    b.subscribe("pub", "data", move |payload| {
        sink.lock().unwrap().push(payload);
    })?;

    wait_for_snapshot(&mut probe, |snapshot| {
        let subscribers = snapshot.pointer("/pub/fields/data/subscribers");
        subscribers == Some(&json!(["a", "b"])) || subscribers == Some(&json!(["b", "a"]))
    })
    .await?;

    // "a" drops; its name disappears from the registry and from every
    // subscriber list.
    drop(a);
    wait_for_snapshot(&mut probe, |snapshot| {
        snapshot.get("a").is_none()
            && snapshot.pointer("/pub/fields/data/subscribers") == Some(&json!(["b"]))
    })
    .await?;

    publisher.post("data", b"x")?;
    let first = wait_for(|| captured.lock().unwrap().first().cloned()).await;
    assert_eq!(first.as_ref(), b"x");

    Ok(())
}

#[tokio::test]
async fn protocol_error_taxonomy() -> Result<()> {
    let server = create_broker(25807).await;

    let mut raw = RawClient::open(server).await?;

    // Anything before SEND_AUTH is rejected and the connection stays
    // unauthenticated.
    raw.send(&Request::Post {
        field: "f".to_owned(),
        payload: Bytes::new(),
    })
    .await?;
    assert_error(raw.read().await?, ErrorKind::InvalidCredentials)?;

    raw.send(&Request::SendAuth {
        name: "w".to_owned(),
    })
    .await?;

    // GET on an unknown pair preserves the legacy error kind.
    raw.send(&Request::Get {
        node: "ghost".to_owned(),
        field: "f".to_owned(),
    })
    .await?;
    assert_error(raw.read().await?, ErrorKind::InvalidCredentials)?;

    raw.send(&Request::Subscribe {
        node: "ghost".to_owned(),
        field: "f".to_owned(),
    })
    .await?;
    assert_error(raw.read().await?, ErrorKind::InvalidSubscribe)?;

    raw.send(&Request::Anon {
        node: "ghost".to_owned(),
        field: "f".to_owned(),
        payload: Bytes::new(),
    })
    .await?;
    assert_error(raw.read().await?, ErrorKind::InvalidAnonTarget)?;

    // The datagram lookup miss echoes the requested name.
    raw.send(&Request::GetDatagramAddr {
        node: "ghost".to_owned(),
    })
    .await?;
    match raw.read().await? {
        Response::Error { kind, context } => {
            assert_eq!(kind, ErrorKind::UnknownDatagramPeer);
            assert_eq!(context.as_ref(), b"ghost");
        }
        other => anyhow::bail!("expected an error, got {other:?}"),
    }

    // A well-formed POST is acknowledged and readable back.
    raw.send(&Request::Post {
        field: "f".to_owned(),
        payload: Bytes::from_static(b"v"),
    })
    .await?;
    assert!(matches!(raw.read().await?, Response::PostAck { .. }));

    raw.send(&Request::Get {
        node: "w".to_owned(),
        field: "f".to_owned(),
    })
    .await?;
    match raw.read().await? {
        Response::Deliver { payload, .. } => assert_eq!(payload.as_ref(), b"v"),
        other => anyhow::bail!("expected a delivery, got {other:?}"),
    }

    Ok(())
}

fn assert_error(response: Response, expected: ErrorKind) -> Result<()> {
    match response {
        Response::Error { kind, .. } => {
            assert_eq!(kind, expected);
            Ok(())
        }
        other => anyhow::bail!("expected {expected:?}, got {other:?}"),
    }
}

async fn wait_for_snapshot(
    probe: &mut RawClient,
    predicate: impl Fn(&serde_json::Value) -> bool,
) -> Result<()> {
    for _ in 0..200 {
        if predicate(&probe.snapshot().await?) {
            return Ok(());
        }

        sleep(Duration::from_millis(25)).await;
    }

    anyhow::bail!("registry never reached the expected shape")
}
