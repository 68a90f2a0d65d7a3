//! Quote polling tests against a mocked quote endpoint.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clockwise::dashboard::{run_poller, IndexPoint, IndexSeries, QuoteSource};

#[tokio::test]
async fn fetch_current_parses_bse_style_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quote"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"indx_nm": "SENSEX", "ltp": "81,332.72", "chg": "+120.4"}
        ])))
        .mount(&server)
        .await;

    let source = QuoteSource::new(format!("{}/quote", server.uri()));
    let value = source.fetch_current().await.unwrap();
    assert_eq!(value, 81332.72);
}

#[tokio::test]
async fn fetch_current_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quote"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = QuoteSource::new(format!("{}/quote", server.uri()));
    assert!(source.fetch_current().await.is_err());
}

#[tokio::test]
async fn poller_appends_points_and_survives_a_failed_fetch() {
    let server = MockServer::start().await;

    // First request fails; later ones succeed.
    Mock::given(method("GET"))
        .and(path("/quote"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/quote"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"CurrentValue": 75000.5})),
        )
        .mount(&server)
        .await;

    let series = Arc::new(Mutex::new(IndexSeries::new()));
    let (broadcast_tx, mut broadcast_rx) = broadcast::channel::<IndexPoint>(16);

    let poller = tokio::spawn(run_poller(
        QuoteSource::new(format!("{}/quote", server.uri())),
        series.clone(),
        broadcast_tx,
        Duration::from_millis(30),
    ));

    // The first successful sample also goes out over the broadcast channel.
    let point = tokio::time::timeout(Duration::from_secs(5), broadcast_rx.recv())
        .await
        .expect("no point broadcast in time")
        .unwrap();
    assert_eq!(point.value, 75000.5);

    poller.abort();

    let series = series.lock().unwrap();
    assert!(!series.is_empty());
    let snapshot = series.snapshot();
    assert!(snapshot.iter().all(|p| p.value == 75000.5));
}
