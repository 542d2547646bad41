use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use concierge_types::EngineEvent;

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn engine_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "engine request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorEnvelope {
            error: err.to_string(),
            code: Some("ENGINE_ERROR".to_string()),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TurnInput {
    utterance: String,
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "concierge server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/global/event", get(events))
        .route("/tools", get(list_tools))
        .route("/session/{id}", get(get_session).delete(delete_session))
        .route("/session/{id}/turn", post(handle_turn))
        .layer(cors)
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "oracle": state.engine.oracle_id(),
        "tools": state.engine.registry().len(),
        "uptime_ms": crate::now_ms().saturating_sub(state.started_at_ms),
    }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registry().all().to_vec())
}

async fn handle_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TurnInput>,
) -> Response {
    match state.engine.handle_turn(&id, &input.utterance).await {
        Ok(outcome) => Json(json!({
            "sessionID": id,
            "status": outcome.status(),
            "reply": outcome.reply(),
            "outcome": outcome,
        }))
        .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.session_snapshot(&id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorEnvelope {
                error: format!("session `{id}` not found"),
                code: Some("SESSION_NOT_FOUND".to_string()),
            }),
        )
            .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.reset_session(&id).await {
        Ok(removed) => Json(json!({ "sessionID": id, "removed": removed })).into_response(),
        Err(err) => engine_error(err),
    }
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let Some(session_id) = filter.session_id.as_deref() else {
        return true;
    };
    event.properties.get("sessionID").and_then(Value::as_str) == Some(session_id)
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.engine.subscribe();
    let connected = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if event_matches_filter(&event, &filter) => serde_json::to_string(&event)
            .ok()
            .map(|payload| Ok(Event::default().data(payload))),
        _ => None,
    });
    connected.chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}
