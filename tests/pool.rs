use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hostinfo_telemetry::cache::TtlCache;
use hostinfo_telemetry::pool::{
    PoolConfig, PoolManager, ERR_INTERNAL_ERROR, ERR_INVALID_TAILNET_ID, ERR_UNAUTHORIZED,
    POOL_ID_HEADER,
};
use hostinfo_telemetry::schema::TelemetrySample;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "pool-secret";

async fn new_pool() -> (PoolManager, Arc<TtlCache<TelemetrySample>>) {
    let cache = Arc::new(TtlCache::in_memory(Duration::from_secs(180)));
    let pool = PoolManager::bind(PoolConfig::new("127.0.0.1:0", SECRET), cache.clone())
        .await
        .unwrap();
    (pool, cache)
}

async fn connect(pool: &PoolManager, pool_id: Option<&str>, bearer: Option<&str>) -> Client {
    let mut req = format!("ws://{}", pool.local_addr())
        .into_client_request()
        .unwrap();

    if let Some(id) = pool_id {
        req.headers_mut()
            .insert(POOL_ID_HEADER, HeaderValue::from_str(id).unwrap());
    }
    if let Some(token) = bearer {
        req.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
    }

    let (ws, _) = connect_async(req).await.unwrap();
    ws
}

async fn wait_for_members(pool: &PoolManager, count: usize) {
    timeout(Duration::from_secs(5), async {
        while pool.member_count() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("member count never settled");
}

/// Next close frame from the server, skipping anything else.
async fn expect_close(ws: &mut Client) -> (CloseCode, String) {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    break (frame.code, frame.reason.as_str().to_string());
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame")
}

async fn next_text(ws: &mut Client) -> Value {
    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no frame")
        .unwrap()
        .unwrap();

    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn collector_header_casing_is_accepted() {
    let (pool, _) = new_pool().await;

    let mut req = format!("ws://{}", pool.local_addr())
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .insert("X-Headplane-Tailnet-ID", HeaderValue::from_static("tn-1"));
    req.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", SECRET)).unwrap(),
    );
    let (_ws, _) = connect_async(req).await.unwrap();

    wait_for_members(&pool, 1).await;
    assert_eq!(pool.member_ids(), ids(&["tn-1"]));
}

#[tokio::test]
async fn protocol_error_closes_with_internal_error() {
    let (pool, _) = new_pool().await;
    let mut stream = TcpStream::connect(pool.local_addr()).await.unwrap();

    let handshake = format!(
        "GET / HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {}: tn-1\r\n\
         Authorization: Bearer {}\r\n\r\n",
        pool.local_addr(),
        POOL_ID_HEADER,
        SECRET
    );
    stream.write_all(handshake.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let body_start = read_until(&mut stream, &mut buf, |b| {
        b.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
    })
    .await;
    assert!(buf.starts_with(b"HTTP/1.1 101"));
    wait_for_members(&pool, 1).await;

    // Clients must mask their frames; this one is not masked.
    stream.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

    // Unmasked server close frame: 0x88, length, 2-byte code, reason.
    let frame_end = read_until(&mut stream, &mut buf, |b| {
        let frame = &b[body_start..];
        (frame.len() >= 2 && frame.len() >= 2 + frame[1] as usize)
            .then(|| body_start + 2 + frame[1] as usize)
    })
    .await;

    let frame = &buf[body_start..frame_end];
    assert_eq!(frame[0], 0x88);
    let code = u16::from_be_bytes([frame[2], frame[3]]);
    assert_eq!(code, 1011);
    assert_eq!(&frame[4..], ERR_INTERNAL_ERROR.as_bytes());

    wait_for_members(&pool, 0).await;
}

/// Reads into `buf` until `done` reports a position.
async fn read_until<F>(stream: &mut TcpStream, buf: &mut Vec<u8>, done: F) -> usize
where
    F: Fn(&[u8]) -> Option<usize>,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(pos) = done(buf.as_slice()) {
                break pos;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("timed out reading from server")
}

#[tokio::test]
async fn missing_pool_id_is_rejected() {
    let (pool, _) = new_pool().await;
    let mut ws = connect(&pool, None, Some(SECRET)).await;

    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, ERR_INVALID_TAILNET_ID);
    assert_eq!(pool.member_count(), 0);
}

#[tokio::test]
async fn wrong_bearer_is_rejected() {
    let (pool, _) = new_pool().await;

    let mut ws = connect(&pool, Some("tailnet-1"), Some("nope")).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, ERR_UNAUTHORIZED);

    let mut ws = connect(&pool, Some("tailnet-1"), None).await;
    let (_, reason) = expect_close(&mut ws).await;
    assert_eq!(reason, ERR_UNAUTHORIZED);

    assert_eq!(pool.member_count(), 0);
}

#[tokio::test]
async fn pushed_samples_are_merged_into_cache() {
    let (pool, cache) = new_pool().await;
    let mut ws = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    wait_for_members(&pool, 1).await;

    let push = json!({
        "n1": { "OS": "linux" },
        "n2": { "OS": "macOS", "IPNVersion": "1.60" },
    });
    ws.send(Message::Text(push.to_string().into())).await.unwrap();

    // Garbage is dropped without closing the connection.
    ws.send(Message::Text("not json".into())).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while cache.len() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("samples never merged");

    assert_eq!(cache.get("n2").unwrap().payload["IPNVersion"], "1.60");
    assert_eq!(pool.member_ids(), ids(&["tailnet-1"]));
}

#[tokio::test]
async fn refresh_reaches_every_member_once() {
    let (pool, _) = new_pool().await;
    let mut first = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    let mut second = connect(&pool, Some("tailnet-2"), Some(SECRET)).await;
    wait_for_members(&pool, 2).await;

    assert_eq!(pool.request_refresh(&[]), 0);
    assert!(timeout(Duration::from_millis(200), first.next()).await.is_err());

    assert_eq!(pool.request_refresh(&ids(&["n2", "n3", "n2"])), 2);

    for ws in [&mut first, &mut second] {
        assert_eq!(next_text(ws).await, json!({ "NodeIDs": ["n2", "n3"] }));
        assert!(timeout(Duration::from_millis(200), ws.next()).await.is_err());
    }
}

#[tokio::test]
async fn refresh_with_no_members_reaches_nobody() {
    let (pool, _) = new_pool().await;
    assert_eq!(pool.request_refresh(&ids(&["n1"])), 0);
}

#[tokio::test]
async fn duplicate_pool_id_replaces_old_connection() {
    let (pool, cache) = new_pool().await;
    let mut old = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    wait_for_members(&pool, 1).await;

    let mut new = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;

    let (code, _) = expect_close(&mut old).await;
    assert_eq!(code, CloseCode::Normal);

    // The old connection's teardown must not evict the new one.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.member_count(), 1);

    assert_eq!(pool.request_refresh(&ids(&["n1"])), 1);
    assert_eq!(next_text(&mut new).await, json!({ "NodeIDs": ["n1"] }));

    new.send(Message::Text(json!({ "n1": { "OS": "ios" } }).to_string().into()))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while cache.get("n1").is_none() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sample never merged");
}

#[tokio::test]
async fn disconnect_removes_member() {
    let (pool, _) = new_pool().await;
    let mut ws = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    wait_for_members(&pool, 1).await;

    ws.close(None).await.unwrap();
    wait_for_members(&pool, 0).await;
    assert!(pool.member_ids().is_empty());
}

#[tokio::test]
async fn keepalive_pings_members() {
    let cache = Arc::new(TtlCache::in_memory(Duration::from_secs(180)));
    let config = PoolConfig {
        keepalive: Duration::from_millis(50),
        ..PoolConfig::new("127.0.0.1:0", SECRET)
    };
    let pool = PoolManager::bind(config, cache).await.unwrap();
    let mut ws = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;

    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no ping")
        .unwrap()
        .unwrap();
    assert!(matches!(msg, Message::Ping(_)));
}

#[tokio::test]
async fn stop_timers_silences_keepalive_but_keeps_sockets() {
    let cache = Arc::new(TtlCache::in_memory(Duration::from_secs(180)));
    let config = PoolConfig {
        keepalive: Duration::from_millis(100),
        ..PoolConfig::new("127.0.0.1:0", SECRET)
    };
    let pool = PoolManager::bind(config, cache).await.unwrap();
    let mut ws = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    wait_for_members(&pool, 1).await;

    pool.stop_timers();
    assert!(timeout(Duration::from_millis(400), ws.next()).await.is_err());
    assert_eq!(pool.member_count(), 1);

    pool.shutdown().await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, CloseCode::Normal);
}

#[tokio::test]
async fn shutdown_closes_every_member() {
    let (pool, _) = new_pool().await;
    let mut a = connect(&pool, Some("tailnet-1"), Some(SECRET)).await;
    let mut b = connect(&pool, Some("tailnet-2"), Some(SECRET)).await;
    wait_for_members(&pool, 2).await;

    pool.shutdown().await;
    assert_eq!(pool.member_count(), 0);

    for ws in [&mut a, &mut b] {
        let (code, _) = expect_close(ws).await;
        assert_eq!(code, CloseCode::Normal);
    }
}

#[tokio::test]
async fn missing_auth_key_fails_to_bind() {
    let cache = Arc::new(TtlCache::in_memory(Duration::from_secs(180)));
    assert!(PoolManager::bind(PoolConfig::new("127.0.0.1:0", ""), cache.clone()).await.is_err());
    assert!(hostinfo_telemetry::pool::start(PoolConfig::new("127.0.0.1:0", ""), cache).await.is_none());
}
