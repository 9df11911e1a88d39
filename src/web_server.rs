use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    serve, Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::constants;
use crate::display::{DisplayEvent, DisplaySink};
use crate::interpreter::Interpreter;
use crate::reading::{Method, ReadingGenerator, RandomReadings};
use crate::session::{run_turn, Session};

/// Messages a browser sends over the WebSocket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ask { method: String, question: String },
    Clear,
    SetApiKey { key: String },
    History,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodInfo {
    pub name: &'static str,
    pub slug: &'static str,
    pub description: &'static str,
}

impl From<Method> for MethodInfo {
    fn from(method: Method) -> Self {
        Self {
            name: method.name(),
            slug: method.slug(),
            description: method.description(),
        }
    }
}

fn method_catalog() -> Vec<MethodInfo> {
    Method::ALL.into_iter().map(MethodInfo::from).collect()
}

// Shared application state. Sessions are not here: each socket owns its own.
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    interpreter: Arc<dyn Interpreter>,
    model: String,
}

impl AppState {
    pub fn new(interpreter: Arc<dyn Interpreter>, model: impl Into<String>) -> Self {
        Self {
            templates: Arc::new(create_minijinja_env(constants::TEMPLATES_DIR.clone())),
            interpreter,
            model: model.into(),
        }
    }
}

fn create_minijinja_env(dir: String) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&dir));
        notifier.watch_path(&dir, true);
        Ok(env)
    })
}

fn render_index(state: &AppState) -> Result<String, minijinja::Error> {
    let env = state.templates.acquire_env()?;
    let template = env.get_template("index.html")?;
    template.render(minijinja::context! {
        title => "智能占卜师",
        methods => method_catalog(),
        model => state.model.as_str(),
    })
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    render_index(&state).map(Html).map_err(|e| {
        error!("Failed to get or render template: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Internal Server Error: {}", e)),
        )
    })
}

async fn methods_handler() -> Json<Vec<MethodInfo>> {
    Json(method_catalog())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One socket, one session. Client messages are handled strictly in order,
/// so a new question is not read until the previous turn has committed.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut session = Session::new();
    let mut generator = RandomReadings::from_os_rng();
    info!(session = %session.id(), "New WebSocket session established");

    let (mut sender, mut receiver) = socket.split();
    let (mut events, mut events_rx) = mpsc::unbounded_channel::<DisplayEvent>();

    let forward = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        warn!("WebSocket client disconnected or send error. Closing connection.");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize display event: {}", e),
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    handle_client_message(
                        message,
                        &mut session,
                        &mut generator,
                        state.interpreter.as_ref(),
                        &mut events,
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Unrecognised client message: {}", e);
                    events.show(DisplayEvent::Rejected {
                        message: format!("无法识别的消息：{}", e),
                    });
                }
            },
            Ok(Message::Binary(_)) => warn!("Received unexpected binary message from client"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => debug!("Received ping/pong from client"),
            Ok(Message::Close(_)) => {
                info!("Client requested WebSocket close");
                break;
            }
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    drop(events);
    let _ = forward.await;
    info!(session = %session.id(), "WebSocket session closed");
}

/// Apply one client message to a session.
pub async fn handle_client_message<G, D>(
    message: ClientMessage,
    session: &mut Session,
    generator: &mut G,
    interpreter: &dyn Interpreter,
    display: &mut D,
) where
    G: ReadingGenerator + ?Sized,
    D: DisplaySink + ?Sized,
{
    match message {
        ClientMessage::Ask { method, question } => {
            let question = question.trim();
            if question.is_empty() {
                display.show(DisplayEvent::Rejected {
                    message: "请输入您想占卜的问题".to_string(),
                });
                return;
            }
            if let Err(e) = run_turn(session, &method, question, generator, interpreter, display).await {
                warn!("Turn rejected: {}", e);
                display.show(DisplayEvent::Rejected {
                    message: e.to_string(),
                });
            }
        }
        ClientMessage::Clear => {
            session.clear();
            display.show(DisplayEvent::Cleared);
        }
        ClientMessage::SetApiKey { key } => {
            session.set_api_key(key);
            let configured = session.api_key().is_some();
            info!(session = %session.id(), has_key = configured, "API key updated");
            display.show(DisplayEvent::KeyUpdated { configured });
        }
        ClientMessage::History => {
            display.show(DisplayEvent::Transcript {
                entries: session.transcript().all().to_vec(),
            });
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let static_files_service = ServeDir::new(constants::STATIC_DIR.as_str()).not_found_service(
        tower::service_fn(|_: Request| async {
            Ok::<Response, std::convert::Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        }),
    );

    Router::new()
        .route("/", get(index_handler))
        .route("/api/methods", get(methods_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(port: u16, interpreter: Arc<dyn Interpreter>, model: String) -> Result<()> {
    let app = build_router(AppState::new(interpreter, model));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
