//! Live stock-index dashboard: poll a quote source on a fixed interval,
//! append to an in-memory series, and push points to browser charts over a
//! websocket. The series is append-only and chronologically ordered; nothing
//! survives a process restart.

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    serve, Router,
};
use chrono::Local;
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::broadcast;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

/// One sampled index value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexPoint {
    pub time: String,
    pub value: f64,
}

/// Append-only series of sampled values for one process lifetime.
#[derive(Debug, Default)]
pub struct IndexSeries {
    points: Vec<IndexPoint>,
}

impl IndexSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, point: IndexPoint) {
        self.points.push(point);
    }

    pub fn snapshot(&self) -> Vec<IndexPoint> {
        self.points.clone()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Messages pushed to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum DashboardEvent {
    /// Full series, sent once on connect.
    Snapshot(Vec<IndexPoint>),
    /// One new sample.
    Point(IndexPoint),
}

/// Fetches the current index value from the quote endpoint.
#[derive(Debug, Clone)]
pub struct QuoteSource {
    http: reqwest::Client,
    url: String,
}

impl QuoteSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Fetch the current index value as a float.
    pub async fn fetch_current(&self) -> Result<f64> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("quote request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("quote endpoint returned {}", response.status()));
        }

        let body: serde_json::Value = response.json().await.context("quote body was not JSON")?;
        extract_index_value(&body)
            .ok_or_else(|| anyhow!("no recognizable index value in quote response"))
    }
}

/// Pull the current value out of a quote payload.
///
/// The BSE endpoint has shuffled both field names and nesting over the years,
/// so accept the known spellings and both bare objects and one-element
/// wrappers, and tolerate comma-grouped number strings.
pub fn extract_index_value(body: &serde_json::Value) -> Option<f64> {
    const KEYS: [&str; 5] = ["CurrentValue", "Current Value", "Curvalue", "ltp", "value"];

    let object = match body {
        serde_json::Value::Object(_) => Some(body),
        serde_json::Value::Array(items) => items.first(),
        _ => None,
    }?;

    // Some payloads wrap the rows in a "Table" array.
    if let Some(table) = object.get("Table").and_then(|t| t.as_array()) {
        if let Some(row) = table.first() {
            return extract_index_value(row);
        }
    }

    for key in KEYS {
        match object.get(key) {
            Some(serde_json::Value::Number(n)) => return n.as_f64(),
            Some(serde_json::Value::String(s)) => {
                if let Ok(v) = s.replace(',', "").trim().parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Clone)]
pub struct DashboardState {
    templates: Arc<AutoReloader>,
    series: Arc<Mutex<IndexSeries>>,
    broadcast_tx: broadcast::Sender<IndexPoint>,
}

fn create_minijinja_env() -> Result<AutoReloader> {
    let reloader = AutoReloader::new(|notifier| {
        let loader = path_loader("templates");
        let mut env = Environment::new();
        env.set_loader(loader);
        notifier.watch_path("templates", true);
        Ok(env)
    });
    Ok(reloader)
}

async fn index_handler(
    State(state): State<DashboardState>,
) -> Result<axum::response::Html<String>, axum::response::Html<String>> {
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("dashboard.html").and_then(|tmpl| {
                let context = minijinja::context! {
                    title => "Live Sensex Dashboard",
                };
                tmpl.render(context)
            })
        })
        .map(axum::response::Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            axum::response::Html(format!("Internal Server Error: {}", e))
        })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: DashboardState) {
    info!("New dashboard WebSocket connection established");
    let (mut sink, mut stream) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    // New subscribers first get the whole series so the chart starts full.
    let snapshot = {
        let series = state.series.lock().expect("series lock poisoned");
        DashboardEvent::Snapshot(series.snapshot())
    };
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if sink.send(Message::Text(json)).await.is_err() {
            warn!("Failed to send snapshot to new dashboard client");
            return;
        }
    }

    loop {
        tokio::select! {
            point = broadcast_rx.recv() => {
                match point {
                    Ok(point) => {
                        let event = DashboardEvent::Point(point);
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if sink.send(Message::Text(json)).await.is_err() {
                                    warn!("Dashboard client disconnected or send error");
                                    break;
                                }
                            }
                            Err(e) => error!("Failed to serialize dashboard event: {}", e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Dashboard client lagged, {} points skipped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Dashboard client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Dashboard WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    info!("Dashboard WebSocket connection closed");
}

/// Poll the quote source forever. A failed fetch is logged and skipped; the
/// next tick retries naturally.
pub async fn run_poller(
    source: QuoteSource,
    series: Arc<Mutex<IndexSeries>>,
    broadcast_tx: broadcast::Sender<IndexPoint>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match source.fetch_current().await {
            Ok(value) => {
                let point = IndexPoint {
                    time: Local::now().format("%H:%M:%S").to_string(),
                    value,
                };
                {
                    let mut series = series.lock().expect("series lock poisoned");
                    series.append(point.clone());
                }
                // No receivers is fine; the chart may not be open yet.
                let _ = broadcast_tx.send(point);
            }
            Err(e) => {
                warn!("Quote fetch failed, skipping this tick: {:#}", e);
            }
        }
    }
}

/// Build the dashboard router; split out so tests can mount it directly.
pub fn dashboard_router(
    series: Arc<Mutex<IndexSeries>>,
    broadcast_tx: broadcast::Sender<IndexPoint>,
) -> Result<Router> {
    let templates = create_minijinja_env().context("Failed to initialize template engine")?;

    let state = DashboardState {
        templates: Arc::new(templates),
        series,
        broadcast_tx,
    };

    Ok(Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/static", ServeDir::new("static"))
        .with_state(state)
        .layer(TraceLayer::new_for_http()))
}

pub async fn start_dashboard(port: u16, quote_url: String, interval: Duration) -> Result<()> {
    let series = Arc::new(Mutex::new(IndexSeries::new()));
    let (broadcast_tx, _) = broadcast::channel::<IndexPoint>(100);

    let poller = tokio::spawn(run_poller(
        QuoteSource::new(quote_url),
        series.clone(),
        broadcast_tx.clone(),
        interval,
    ));

    let app = dashboard_router(series, broadcast_tx)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Dashboard listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    let result = serve(listener, app.into_make_service())
        .await
        .context("Dashboard server failed");

    poller.abort();
    result
}
