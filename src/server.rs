//! Inbound side: the handler seam every agent implements, the decode/handle/encode
//! pipeline, and the HTTP binding that exposes it.

use crate::{
    acl::{self, Decoded, Envelope, Performative},
    client::AgentClient,
    error::Result,
    model::AgentIdentity,
};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Client used to stamp replies and reach other agents.
    fn client(&self) -> &AgentClient;

    async fn handle(&self, envelope: Envelope) -> Envelope;

    fn identity(&self) -> &AgentIdentity {
        self.client().identity()
    }

    fn not_understood(&self, receiver: Option<&str>) -> Envelope {
        self.client().message(Performative::NotUnderstood, receiver, None)
    }
}

/// Runs one wire document through `handler`. Never fails: anything that
/// cannot be decoded is answered with `not-understood`.
pub async fn serve_document(handler: &dyn MessageHandler, document: Value) -> Value {
    let reply = match acl::decode(&document) {
        Ok(Decoded::Message(envelope)) => {
            debug!(
                "{} <- {}: {} #{}",
                handler.identity().name,
                envelope.sender,
                envelope.performative,
                envelope.conversation_seq
            );
            handler.handle(envelope).await
        }
        Ok(Decoded::Unparseable) => {
            debug!("{} received a document without a performative", handler.identity().name);
            handler.not_understood(None)
        }
        Err(e) => {
            warn!("{} could not decode message: {}", handler.identity().name, e);
            handler.not_understood(document.get("sender").and_then(Value::as_str))
        }
    };

    match acl::encode(&reply) {
        Ok(document) => document,
        Err(e) => {
            error!("{} produced an unencodable reply: {}", handler.identity().name, e);
            serde_json::json!({
                "performative": Performative::NotUnderstood.as_str(),
                "sender": handler.identity().uri,
                "conversationSeq": reply.conversation_seq,
            })
        }
    }
}

#[derive(Clone)]
struct AppState {
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<Notify>,
}

pub fn router(handler: Arc<dyn MessageHandler>, shutdown: Arc<Notify>) -> Router {
    let state = AppState { handler, shutdown };

    Router::new()
        .route("/comm", post(comm))
        .route("/info", get(info))
        .route("/health", get(health_check))
        .route("/stop", post(stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `handler` on `bind_address` until `POST /stop` or ctrl-c.
pub async fn serve(handler: Arc<dyn MessageHandler>, bind_address: &str) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    let app = router(handler.clone(), shutdown.clone());

    let listener = TcpListener::bind(bind_address).await?;
    info!(
        "{} ({}) listening on {}",
        handler.identity().name,
        handler.identity().capability,
        bind_address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await?;

    info!("{} stopped", handler.identity().name);
    Ok(())
}

async fn comm(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let document = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(serve_document(state.handler.as_ref(), document).await)
}

async fn info(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!(state.handler.identity()))
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn stop(State(state): State<AppState>) -> Json<Value> {
    info!("{} received stop request", state.handler.identity().name);
    state.shutdown.notify_one();
    Json(serde_json::json!({"status": "stopping"}))
}
