//! End-to-end proxy behavior over live TCP: routing, hints, local verbs,
//! pipelining, and error pass-through.

mod support;

use bytes::BytesMut;
use futures::StreamExt;
use resp::Value;
use shoal::coordinator::SoloCoordinator;
use support::{b, spawn_backend, spawn_proxy};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

#[tokio::test]
async fn pass_through_commands_land_on_a_stable_backend() {
    let (addr_a, backend_a, _stop_a) = spawn_backend().await;
    let (addr_b, backend_b, _stop_b) = spawn_backend().await;
    let proxy = spawn_proxy(
        &[addr_a.clone(), addr_b.clone()],
        SoloCoordinator::new("p1"),
    )
    .await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"SET", &[b("foo"), b("bar")]).await.unwrap();
    assert_eq!(reply, Value::Simple("OK".to_string()));
    let reply = conn.command(b"GET", &[b("foo")]).await.unwrap();
    assert_eq!(reply, Value::bulk("bar"));

    // Both commands were routed by "foo" and must land on its owner.
    let owner = proxy.cluster.locate(b"foo").unwrap();
    let (own, other) = if owner == addr_a {
        (&backend_a, &backend_b)
    } else {
        (&backend_b, &backend_a)
    };
    assert!(own.contains(b"foo"));
    assert!(!other.contains(b"foo"));
}

#[tokio::test]
async fn hash_hint_overrides_routing_and_is_stripped() {
    let (addr_a, backend_a, _stop_a) = spawn_backend().await;
    let (addr_b, backend_b, _stop_b) = spawn_backend().await;
    let proxy = spawn_proxy(
        &[addr_a.clone(), addr_b.clone()],
        SoloCoordinator::new("p1"),
    )
    .await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    // If the hint leaked through, the backend would reject SET with an
    // arity error instead of storing the value.
    let reply = conn
        .command(b"SET", &[b("item"), b("v1"), b("hash=shard7")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Simple("OK".to_string()));
    let reply = conn
        .command(b"GET", &[b("item"), b("hash=shard7")])
        .await
        .unwrap();
    assert_eq!(reply, Value::bulk("v1"));

    // Routed by "shard7", not by "item".
    let owner = proxy.cluster.locate(b"shard7").unwrap();
    let hinted = if owner == addr_a { &backend_a } else { &backend_b };
    assert!(hinted.contains(b"item"));
}

#[tokio::test]
async fn index_hint_routes_by_the_named_argument() {
    let (addr_a, backend_a, _stop_a) = spawn_backend().await;
    let (addr_b, backend_b, _stop_b) = spawn_backend().await;
    let proxy = spawn_proxy(
        &[addr_a.clone(), addr_b.clone()],
        SoloCoordinator::new("p1"),
    )
    .await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn
        .command(b"SET", &[b("akey"), b("aval"), b("index=2")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Simple("OK".to_string()));

    // index=2 names "aval" as the routing key.
    let owner = proxy.cluster.locate(b"aval").unwrap();
    let hinted = if owner == addr_a { &backend_a } else { &backend_b };
    assert!(hinted.contains(b"akey"));
}

#[tokio::test]
async fn invalid_index_hints_are_rejected() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn
        .command(b"GET", &[b("item"), b("index=9")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Error("ERR invalid index [9]".to_string()));

    let reply = conn
        .command(b"GET", &[b("item"), b("index=0")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Error("ERR invalid index [0]".to_string()));
}

#[tokio::test]
async fn ping_is_local_unless_hinted() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"PING", &[]).await.unwrap();
    assert_eq!(reply, Value::Simple("PONG".to_string()));

    // A hinted ping is forwarded to the backend owning the hint key.
    let reply = conn
        .command(b"PING", &[b("ignored"), b("hash=somewhere")])
        .await
        .unwrap();
    assert_eq!(reply, Value::Simple("PONG".to_string()));
}

#[tokio::test]
async fn config_replies_with_the_benchmark_stub() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"CONFIG", &[b("GET"), b("save")]).await.unwrap();
    assert_eq!(
        reply,
        Value::Array(vec![Value::bulk("save"), Value::bulk("")])
    );
}

#[tokio::test]
async fn quit_replies_ok_and_closes() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"QUIT", &[]).await.unwrap();
    assert_eq!(reply, Value::Simple("OK".to_string()));
    assert!(conn.command(b"PING", &[]).await.is_err());
}

#[tokio::test]
async fn detach_replies_ok_and_closes() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"DETACH", &[]).await.unwrap();
    assert_eq!(reply, Value::Simple("OK".to_string()));
    assert!(conn.command(b"PING", &[]).await.is_err());
}

#[tokio::test]
async fn backend_errors_pass_through_verbatim() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let mut conn = resp::client::Conn::dial(&proxy.addr).await.unwrap();
    let reply = conn.command(b"FLUSHALL", &[b("now")]).await.unwrap();
    assert_eq!(
        reply,
        Value::Error("ERR unknown command 'FLUSHALL'".to_string())
    );
}

// Pipelined commands from one producer complete in submission order.
#[tokio::test]
async fn pipelined_commands_reply_in_fifo_order() {
    let (addr_a, _backend_a, _stop_a) = spawn_backend().await;
    let proxy = spawn_proxy(&[addr_a], SoloCoordinator::new("p1")).await;

    let stream = TcpStream::connect(&proxy.addr).await.unwrap();
    let (r, mut w) = stream.into_split();

    let mut buf = BytesMut::new();
    for chunk in ["a", "b", "c"] {
        resp::encode(
            &Value::Array(vec![Value::bulk("APPEND"), Value::bulk("fifo"), Value::bulk(chunk)]),
            &mut buf,
        );
    }
    resp::encode(
        &Value::Array(vec![Value::bulk("GET"), Value::bulk("fifo")]),
        &mut buf,
    );
    w.write_all(&buf).await.unwrap();

    let mut replies = FramedRead::new(r, resp::Codec);
    assert_eq!(replies.next().await.unwrap().unwrap(), Value::Integer(1));
    assert_eq!(replies.next().await.unwrap().unwrap(), Value::Integer(2));
    assert_eq!(replies.next().await.unwrap().unwrap(), Value::Integer(3));
    assert_eq!(replies.next().await.unwrap().unwrap(), Value::bulk("abc"));
}
