use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pagegist::config::{GateConfig, TEXT_GENERATION_RESOURCE};
use pagegist::fetch::{origin_key, FetchError, PageFetcher};
use pagegist::governor::{ConcurrencyGate, Payload};
use reqwest::{StatusCode, Url};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::common::{memory_governor, summary_of, test_config, ScriptedTransport};

/// Requests being handled right now, and the most seen at once.
#[derive(Default)]
struct Concurrency {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Minimal HTTP/1.1 server: `/missing` is a 404, every other path a page.
struct PageServer {
    addr: SocketAddr,
    local: Arc<Concurrency>,
}

impl PageServer {
    async fn start(delay: Duration, shared: Arc<Concurrency>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let local = Arc::new(Concurrency::default());

        let counters = (local.clone(), shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (local, shared) = counters.clone();
                tokio::spawn(async move {
                    serve(stream, delay, &local, &shared).await;
                });
            }
        });

        Self { addr, local }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn origin(&self) -> String {
        origin_key(&Url::parse(&self.url("/")).expect("url")).expect("origin")
    }
}

async fn serve(mut stream: TcpStream, delay: Duration, local: &Concurrency, shared: &Concurrency) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&request);
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

    local.enter();
    shared.enter();
    tokio::time::sleep(delay).await;
    // Counted out before replying, so the client cannot start its next
    // request while this one still looks active.
    shared.leave();
    local.leave();

    let (status, body) = if path == "/missing" {
        ("404 Not Found", "not found".to_string())
    } else {
        (
            "200 OK",
            format!("<html><body><p>page at {path}</p><a href=\"/next\">next</a></body></html>"),
        )
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn fetcher(gate: Arc<ConcurrencyGate>) -> PageFetcher {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client");
    PageFetcher::with_client(client, gate)
}

#[tokio::test]
async fn test_one_fetch_per_origin_while_origins_overlap() {
    let shared = Arc::new(Concurrency::default());
    let site_a = PageServer::start(Duration::from_millis(60), shared.clone()).await;
    let site_b = PageServer::start(Duration::from_millis(60), shared.clone()).await;
    let gate = Arc::new(ConcurrencyGate::new(GateConfig::default()));
    let fetcher = fetcher(gate.clone());

    let urls: Vec<String> = (0..3)
        .flat_map(|i| [site_a.url(&format!("/a{i}")), site_b.url(&format!("/b{i}"))])
        .collect();
    let pages = join_all(urls.iter().map(|url| fetcher.fetch(url))).await;

    for page in pages {
        let page = page.expect("page");
        assert_eq!(page.status, 200);
        assert!(page.text().starts_with("page at /"));
    }
    assert_eq!(gate.limit(&site_a.origin()), 1);
    assert_eq!(site_a.local.peak(), 1, "same origin fetched in parallel");
    assert_eq!(site_b.local.peak(), 1, "same origin fetched in parallel");
    assert_eq!(shared.peak(), 2, "different origins should overlap");
    assert_eq!(gate.tracked(), 0);
}

#[tokio::test]
async fn test_origin_limit_is_configurable() {
    let shared = Arc::new(Concurrency::default());
    let site = PageServer::start(Duration::from_millis(60), shared).await;
    let gate = Arc::new(ConcurrencyGate::new(
        GateConfig::default().with_origin_limit(2),
    ));
    let fetcher = fetcher(gate);

    let urls: Vec<String> = (0..6).map(|i| site.url(&format!("/p{i}"))).collect();
    for page in join_all(urls.iter().map(|url| fetcher.fetch(url))).await {
        page.expect("page");
    }

    assert_eq!(site.local.peak(), 2);
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let site = PageServer::start(Duration::ZERO, Arc::default()).await;
    let gate = Arc::new(ConcurrencyGate::new(GateConfig::default()));
    let fetcher = fetcher(gate.clone());

    let err = fetcher.fetch(&site.url("/missing")).await.unwrap_err();

    match err {
        FetchError::Status { url, status } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(url.ends_with("/missing"));
        }
        other => panic!("expected a status error, got {other:?}"),
    }
    // The origin's slot was returned.
    assert_eq!(gate.available(&site.origin()), 1);
}

#[tokio::test]
async fn test_closed_origin_is_not_fetched() {
    let site = PageServer::start(Duration::ZERO, Arc::default()).await;
    let gate = Arc::new(ConcurrencyGate::new(GateConfig::default()));
    let fetcher = fetcher(gate.clone());

    gate.close(&site.origin());
    let err = fetcher.fetch(&site.url("/")).await.unwrap_err();

    assert!(matches!(err, FetchError::Gate(pagegist::GovernorError::GateClosed(_))));
    assert_eq!(site.local.peak(), 0);
}

#[tokio::test]
async fn test_governor_and_fetcher_share_one_gate() {
    let site = PageServer::start(Duration::ZERO, Arc::default()).await;
    let gate = Arc::new(ConcurrencyGate::new(
        GateConfig::default().with_limit(TEXT_GENERATION_RESOURCE, 1),
    ));
    let transport = ScriptedTransport::new();
    let (governor, _cache) = memory_governor(test_config(), transport.clone());
    let governor = governor.with_gate(gate.clone());
    let fetcher = fetcher(governor.gate().clone());
    assert!(Arc::ptr_eq(governor.gate(), &gate));

    // A slot taken through the governor's gate holds back the fetcher.
    let held = governor
        .gate()
        .acquire(&site.origin())
        .await
        .expect("slot");
    let url = site.url("/article");
    let pending = tokio::time::timeout(Duration::from_millis(100), fetcher.fetch(&url)).await;
    assert!(pending.is_err(), "fetch must wait for the origin slot");
    assert_eq!(site.local.peak(), 0);
    held.release();

    let page = fetcher.fetch(&url).await.expect("page");
    let text = page.text();
    let completion = governor
        .execute(Payload::new(text.clone()).with_instruction("Summarise."))
        .await
        .expect("summary");

    assert_eq!(completion, summary_of(&text));
    assert_eq!(transport.call_count(), 1);
    assert_eq!(gate.available(TEXT_GENERATION_RESOURCE), 1);
    assert_eq!(page.links(), vec![Url::parse(&site.url("/next")).expect("url")]);
}
