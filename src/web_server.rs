//! Web chat UI: index page plus a websocket that drives the tool-dispatch
//! loop. Each websocket connection owns its own `ChatSession`; the socket
//! task is the only writer, so the transcript needs no locking.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    serve, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::gemini::GeminiClient;
use crate::session::{run_turn, ChatEvent, ChatSession, Role, GREETING};

/// Messages a browser client may send over the websocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Chat { text: String },
    Reset,
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    client: GeminiClient,
}

// Minijinja Environment setup
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
    State(state): State<AppState>,
) -> Result<axum::response::Html<String>, axum::response::Html<String>> {
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("chat.html").and_then(|tmpl| {
                let context = minijinja::context! {
                    title => "Clockwise Chat",
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

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// Handle one chat connection: one session, strictly one turn at a time.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New chat WebSocket connection established");
    let (mut sink, mut stream) = socket.split();

    // Forward ChatEvents from the turn loop to the browser as JSON.
    let (event_tx, mut event_rx) = mpsc::channel::<ChatEvent>(64);
    let forward_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        warn!("WebSocket client disconnected during send");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize chat event: {}", e),
            }
        }
    });

    let mut session = ChatSession::new();
    let mut rng = StdRng::from_entropy();

    let _ = event_tx
        .send(ChatEvent::Turn {
            role: Role::Model,
            text: GREETING.to_string(),
        })
        .await;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Chat { text }) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    // One outstanding remote call at a time: the turn runs to
                    // completion before the next client message is read.
                    run_turn(&mut session, &state.client, &text, &mut rng, &event_tx).await;
                }
                Ok(ClientMessage::Reset) => {
                    session.reset();
                    let _ = event_tx
                        .send(ChatEvent::Turn {
                            role: Role::Model,
                            text: GREETING.to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!("Unparseable client message: {} ({})", text, e);
                }
            },
            Message::Close(_) => {
                info!("Client requested WebSocket close");
                break;
            }
            _ => {}
        }
    }

    drop(event_tx);
    let _ = forward_task.await;
    info!("Chat WebSocket connection closed");
}

/// Build the chat router; split out so tests can mount it directly.
pub fn chat_router(client: GeminiClient) -> Result<Router> {
    let templates = create_minijinja_env().context("Failed to initialize template engine")?;

    let state = AppState {
        templates: Arc::new(templates),
        client,
    };

    Ok(Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/static", ServeDir::new("static"))
        .with_state(state)
        .layer(TraceLayer::new_for_http()))
}

pub async fn start_web_server(port: u16, client: GeminiClient) -> Result<()> {
    let app = chat_router(client)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Chat web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
