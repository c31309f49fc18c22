//! Session streaming over Server-Sent Events.
//!
//! - `GET  /sse?session_id=...`       subscribe; `CONNECTED`, answer, `END_STREAM`
//! - `POST /messages?session_id=...`  accept a prompt and stream its answer to the session

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use crmpilot_agent::pipeline::QueryRequest;
use crmpilot_core::errors::ApplicationError;
use crmpilot_core::stream::StreamEvent;
use futures::{stream, Stream, StreamExt};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bootstrap::AppState;

pub const CONNECTED: &str = "CONNECTED";
pub const END_STREAM: &str = "END_STREAM";

pub fn routes() -> Router<AppState> {
    Router::new().route("/sse", get(subscribe)).route("/messages", post(submit))
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    pub session_id: Option<String>,
    pub instance_url: Option<String>,
    pub instance_api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub message: &'static str,
    pub session_id: String,
    pub status: &'static str,
    pub note: &'static str,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct StreamError {
    pub error: String,
}

type Rejection = (StatusCode, Json<StreamError>);

fn bad_request(message: impl Into<String>) -> Rejection {
    (StatusCode::BAD_REQUEST, Json(StreamError { error: message.into() }))
}

fn required_session(params: &SessionParams) -> Result<String, Rejection> {
    match params.session_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(bad_request("session_id is required")),
    }
}

/// Wire form of a broker event. Payload newlines are escaped so every event is one
/// `data:` line.
pub fn wire_data(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Payload(text) => escape(text),
        StreamEvent::Error(message) => format!("ERROR: {}", escape(message)),
        StreamEvent::End => END_STREAM.to_string(),
    }
}

fn escape(text: &str) -> String {
    text.replace('\r', "").replace('\n', "\\n")
}

async fn subscribe(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Rejection> {
    let session_id = required_session(&params)?;
    let subscription = state.broker.open(&session_id);

    info!(
        event_name = "server.sse.connected",
        session_id = %session_id,
        subscribers = state.broker.subscriber_count(&session_id),
        "stream subscriber attached"
    );

    let events = stream::once(async { Ok::<_, Infallible>(Event::default().data(CONNECTED)) }).chain(
        subscription.map(|event| Ok::<_, Infallible>(Event::default().data(wire_data(&event)))),
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn submit(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    body: Result<Json<MessageBody>, JsonRejection>,
) -> Result<Json<Accepted>, Rejection> {
    let session_id = required_session(&params)?;
    let Json(body) = body.map_err(|rejection| bad_request(rejection.body_text()))?;
    let correlation_id = Uuid::new_v4().to_string();

    let request = QueryRequest::new(
        body.prompt.unwrap_or_default(),
        params.instance_url.unwrap_or_default(),
        SecretString::from(params.instance_api_key.unwrap_or_default()),
        &correlation_id,
    );
    if let Err(error) = request.validate() {
        let interface = ApplicationError::from(error).into_interface(&correlation_id);
        warn!(
            event_name = "server.messages.rejected",
            correlation_id = %correlation_id,
            session_id = %session_id,
            error = interface.detail(),
            "streamed query rejected"
        );
        return Err(bad_request(interface.detail()));
    }

    state.broker.reset(&session_id);

    let pipeline = Arc::clone(&state.pipeline);
    let broker = state.broker.clone();
    let task_session = session_id.clone();
    tokio::spawn(async move {
        // Failures are already relayed to subscribers as error events.
        let _ = pipeline.run_streaming(&task_session, &request, &broker).await;
    });

    info!(
        event_name = "server.messages.accepted",
        correlation_id = %correlation_id,
        session_id = %session_id,
        "streamed query accepted"
    );

    Ok(Json(Accepted {
        message: "Request accepted",
        session_id,
        status: "processing",
        note: "Use the SSE endpoint to receive the response stream",
        correlation_id,
    }))
}
