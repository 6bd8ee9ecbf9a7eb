//! CONNECT dispatcher tests
//!
//! Drives hijacked connections through every non-TLS tunnel mode against
//! loopback origins.

mod common;

use common::{tcp_pair, TestCa};
use interpose::{
    ConnectAction, ConnectRequest, HttpResponse, MitmProxy, ProxyContext, ProxyDialer,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn run_connect(proxy: &Arc<MitmProxy>, authority: &str) -> TcpStream {
    common::init_tracing();
    let (client, hijacked) = tcp_pair().await;
    proxy.serve_connect(hijacked, ConnectRequest::new(authority));
    client
}

async fn read_exact_string(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_accept_tunnels_bytes_bidirectionally() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.write_all(b"-ok").await.unwrap();
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority()).build();
    let mut client = run_connect(&proxy, &origin_addr.to_string()).await;

    assert_eq!(
        read_exact_string(&mut client, 19).await,
        "HTTP/1.1 200 OK\r\n\r\n"
    );

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_string(&mut client, 7).await, "ping-ok");
}

#[tokio::test]
async fn test_accept_dial_failure_writes_500() {
    let proxy = MitmProxy::builder(TestCa::generate("t").authority()).build();
    // Port 1 on loopback refuses connections.
    let mut client = run_connect(&proxy, "127.0.0.1:1").await;

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("HTTP/1.1 500 Server error\r\n\r\n"),
        "got: {}",
        text
    );
}

#[tokio::test]
async fn test_reject_without_response_closes_silently() {
    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(|host: &str, _ctx: &mut ProxyContext| {
            (Some(ConnectAction::Reject), host.to_string())
        })
        .build();
    let mut client = run_connect(&proxy, "example.com:443").await;

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_reject_writes_prepared_response() {
    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(|host: &str, ctx: &mut ProxyContext| {
            ctx.response = Some(HttpResponse::new(403, "Forbidden", b"denied".to_vec()));
            (Some(ConnectAction::Reject), host.to_string())
        })
        .build();
    let mut client = run_connect(&proxy, "example.com:443").await;

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {}", text);
    assert!(text.ends_with("denied"), "got: {}", text);
}

#[tokio::test]
async fn test_handler_chain_first_decision_wins_and_rewrites_host() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        stream.write_all(b"rewritten").await.unwrap();
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(|host: &str, _ctx: &mut ProxyContext| {
            // Abstain; the next handler decides.
            (None, host.to_string())
        })
        .with_connect_handler(move |_host: &str, _ctx: &mut ProxyContext| {
            (Some(ConnectAction::Accept), origin_addr.to_string())
        })
        .with_connect_handler(|_host: &str, _ctx: &mut ProxyContext| {
            panic!("chain must stop at the first decision")
        })
        .build();

    let mut client = run_connect(&proxy, "ignored.example.com:443").await;
    assert_eq!(
        read_exact_string(&mut client, 19).await,
        "HTTP/1.1 200 OK\r\n\r\n"
    );
    assert_eq!(read_exact_string(&mut client, 9).await, "rewritten");
}

#[tokio::test]
async fn test_hijack_answers_http10_and_transfers_ownership() {
    let hijack: interpose::HijackFn = Arc::new(|_req, mut client, _ctx| {
        Box::pin(async move {
            client.write_all(b"hijacked").await.unwrap();
        })
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(move |host: &str, _ctx: &mut ProxyContext| {
            (Some(ConnectAction::Hijack(Arc::clone(&hijack))), host.to_string())
        })
        .build();

    let mut client = run_connect(&proxy, "example.com:443").await;
    assert_eq!(
        read_exact_string(&mut client, 19).await,
        "HTTP/1.0 200 OK\r\n\r\n"
    );
    assert_eq!(read_exact_string(&mut client, 8).await, "hijacked");
}

#[tokio::test]
async fn test_proxy_auth_hijack_leaves_header_block_open() {
    let hijack: interpose::HijackFn = Arc::new(|_req, mut client, _ctx| {
        Box::pin(async move {
            // The status line is unterminated; the callback finishes the
            // header block.
            client
                .write_all(b"Proxy-Authenticate: Basic realm=\"interpose\"\r\n\r\n")
                .await
                .unwrap();
        })
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(move |host: &str, _ctx: &mut ProxyContext| {
            (
                Some(ConnectAction::ProxyAuthHijack(Arc::clone(&hijack))),
                host.to_string(),
            )
        })
        .build();

    let mut client = run_connect(&proxy, "example.com:443").await;
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(
        String::from_utf8_lossy(&response),
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"interpose\"\r\n\r\n"
    );
}

#[tokio::test]
async fn test_http_mitm_round_trips_and_filters() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = origin.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                return;
            }
            if line == "\r\n" {
                break;
            }
        }
        reader
            .get_mut()
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(|host: &str, _ctx: &mut ProxyContext| {
            (Some(ConnectAction::MitmHttp), host.to_string())
        })
        .with_response_filter(|mut resp, _ctx| {
            resp.set_header("X-Inspected", "1");
            resp
        })
        .build();

    let mut client = run_connect(&proxy, &origin_addr.to_string()).await;
    assert_eq!(
        read_exact_string(&mut client, 19).await,
        "HTTP/1.0 200 OK\r\n\r\n"
    );

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.b\r\n\r\n")
        .await
        .unwrap();

    let mut reader = BufReader::new(client);
    let response = interpose::http1::read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
    assert_eq!(response.header("X-Inspected"), Some("1"));
}

#[tokio::test]
async fn test_http_mitm_filter_synthesized_response_skips_origin() {
    // No origin at all: the filter must answer before any dialing matters.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        // Accept the dial but never speak.
        let _stream = origin.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_connect_handler(|host: &str, _ctx: &mut ProxyContext| {
            (Some(ConnectAction::MitmHttp), host.to_string())
        })
        .with_request_filter(|req, _ctx| {
            (req, Some(HttpResponse::new(204, "No Content", Vec::new())))
        })
        .build();

    let mut client = run_connect(&proxy, &origin_addr.to_string()).await;
    assert_eq!(
        read_exact_string(&mut client, 19).await,
        "HTTP/1.0 200 OK\r\n\r\n"
    );

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.b\r\n\r\n")
        .await
        .unwrap();

    let mut reader = BufReader::new(client);
    let response = interpose::http1::read_response(&mut reader).await.unwrap();
    assert_eq!(response.status, 204);
}

#[tokio::test]
async fn test_accept_through_refusing_upstream_reports_500() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut discard = [0u8; 1024];
        let _ = stream.read(&mut discard).await;
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let proxy = MitmProxy::builder(TestCa::generate("t").authority())
        .with_upstream(ProxyDialer::new(&format!("http://{}", upstream_addr)).unwrap())
        .build();

    let mut client = run_connect(&proxy, "target.example.com:443").await;
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 500 Server error\r\n\r\n"), "got: {}", text);
    assert!(text.contains("proxy refused connection"), "got: {}", text);
}
