use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use webants::{
    cfg::config::{DownloaderConfig, SchedulerConfig, SpiderConfig},
    circuit::CircuitRegistry,
    downloader::{Downloader, transport::ReqwestTransport},
    driver::signal::SignalBus,
    frontier::Frontier,
    model::{Record, Request, Sink, request::BoxFuture},
    stats::Stats,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

struct NullSink;
impl Sink for NullSink {
    fn save<'a>(&'a self, _record: Record) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn downloader_cfg() -> DownloaderConfig {
    DownloaderConfig {
        concurrency: 8,
        request_timeout: std::time::Duration::from_secs(5),
        retry_delay: std::time::Duration::from_millis(5),
        follow_redirects: true,
        user_agent: "webants-tests/0.1".to_string(),
        max_redirects: 5,
    }
}

fn spider_cfg() -> SpiderConfig {
    SpiderConfig {
        failure_threshold: 3,
        recovery_timeout: std::time::Duration::from_millis(50),
        retry_sweep_interval: std::time::Duration::from_secs(30),
    }
}

fn scheduler_cfg() -> SchedulerConfig {
    SchedulerConfig {
        max_requests: 0,
        request_delay: std::time::Duration::ZERO,
        domain_delay: std::time::Duration::ZERO,
        max_domain_concurrent: 8,
        max_queue_size: 64,
    }
}

/// Drives a request through `frontier`/`downloader` the way a worker would,
/// looping while a retry re-admits rather than resolving it, until a
/// terminal Response comes back.
async fn run_to_completion(
    downloader: &Downloader,
    frontier: &Frontier,
    req: Request,
    cancel: &CancellationToken,
) -> webants::model::Response {
    frontier.admit(req).await;
    loop {
        let (req, ticket) = frontier.next().await;
        let result = downloader.fetch(req, cancel).await;
        frontier.complete(ticket).await;
        if let Some(resp) = result {
            return resp;
        }
    }
}

#[tokio::test]
async fn retry_then_success_reaches_200() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestTransport::new(&downloader_cfg())?);
    let signals = Arc::new(SignalBus::new());
    let frontier = Arc::new(Frontier::new(scheduler_cfg(), signals.clone()));
    let downloader = Downloader::new(
        &downloader_cfg(),
        transport,
        frontier.clone(),
        Arc::new(CircuitRegistry::new(&spider_cfg())),
        signals,
        Arc::new(Stats::default()),
    );

    let req = Request::get(format!("{}/flaky", server.uri()));
    let cancel = CancellationToken::new();
    let resp = run_to_completion(&downloader, &frontier, req, &cancel).await;

    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ok");
    Ok(())
}

#[tokio::test]
async fn circuit_opens_after_repeated_failures_on_one_host() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let circuits = Arc::new(CircuitRegistry::new(&SpiderConfig {
        failure_threshold: 1,
        recovery_timeout: std::time::Duration::from_secs(60),
        retry_sweep_interval: std::time::Duration::from_secs(30),
    }));
    let transport = Arc::new(ReqwestTransport::new(&downloader_cfg())?);
    let signals = Arc::new(SignalBus::new());
    let frontier = Arc::new(Frontier::new(scheduler_cfg(), signals.clone()));
    let downloader =
        Downloader::new(&downloader_cfg(), transport, frontier.clone(), circuits.clone(), signals, Arc::new(Stats::default()));

    let host = url::Url::parse(&server.uri())?.host_str().unwrap().to_string();
    assert!(circuits.allow_request(&host));

    let req = Request::get(format!("{}/down", server.uri()));
    let cancel = CancellationToken::new();
    let resp = run_to_completion(&downloader, &frontier, req, &cancel).await;
    // 500 is in the retry table (3 retries); after exhausting, it still
    // records a circuit failure for the host.
    assert_eq!(resp.status, 500);
    assert!(!circuits.allow_request(&host));
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_are_bounded_by_global_semaphore() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(50)))
        .mount(&server)
        .await;

    let mut cfg = downloader_cfg();
    cfg.concurrency = 2;
    let transport = Arc::new(ReqwestTransport::new(&cfg)?);
    let signals = Arc::new(SignalBus::new());
    let frontier = Arc::new(Frontier::new(scheduler_cfg(), signals.clone()));
    let downloader = Arc::new(Downloader::new(
        &cfg,
        transport,
        frontier,
        Arc::new(CircuitRegistry::new(&spider_cfg())),
        signals,
        Arc::new(Stats::default()),
    ));

    let inflight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let downloader = downloader.clone();
        let inflight = inflight.clone();
        let max_seen = max_seen.clone();
        let url = format!("{}/slow", server.uri());
        handles.push(tokio::spawn(async move {
            let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            let cancel = CancellationToken::new();
            let resp = downloader.fetch(Request::get(url), &cancel).await.expect("200 is terminal");
            inflight.fetch_sub(1, Ordering::SeqCst);
            resp.status
        }));
    }
    for handle in handles {
        assert_eq!(handle.await?, 200);
    }

    assert!(max_seen.load(Ordering::SeqCst) <= 2, "global concurrency cap of 2 was exceeded");
    Ok(())
}
