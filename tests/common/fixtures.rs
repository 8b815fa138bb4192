//! Fixture site served by wiremock, plus config and run helpers

use spiderq::{Config, Pipeline, PipelineStats};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// HTML page containing one anchor per link
pub fn html_page(links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{href}">{href}</a>"#))
        .collect();
    format!("<html><body>{anchors}</body></html>")
}

/// Serve `links` as an HTML page at `route`, expecting exactly `hits` GETs
pub async fn mount_page(server: &MockServer, route: &str, links: &[&str], hits: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html_page(links), "text/html"))
        .expect(hits)
        .mount(server)
        .await;
}

/// Config tuned for local servers: quick idle stop, no transport retries
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.idle_timeout = Some(Duration::from_millis(300));
    config.pipeline.requeue_delay = Duration::from_millis(5);
    config.http.timeout = Duration::from_secs(2);
    config.http.retry.max_attempts = 0;
    config
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// Run from `seed` until the pipeline goes idle
pub async fn crawl(pipeline: &Pipeline, seed: &str) -> PipelineStats {
    tokio::time::timeout(
        Duration::from_secs(20),
        pipeline.run_with_seed(CancellationToken::new(), seed),
    )
    .await
    .expect("crawl should stop once idle")
    .expect("seed should be accepted")
}
