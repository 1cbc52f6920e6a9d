use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use switchyard_core::broadcast::Subscriber;
use switchyard_core::{MessagesReply, ProxyError};
use switchyard_oauth::OAuthError;
use switchyard_protocol::anthropic::count_tokens::CountTokensBody;
use switchyard_protocol::anthropic::request::CreateMessageBody;

use crate::AppState;
use crate::auth::client_credential;

pub(crate) fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.body())).into_response()
}

pub(crate) async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed: CreateMessageBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "invalid request body: {err}"
            )));
        }
    };
    let inbound = client_credential(&headers);
    match state.orchestrator.handle_messages(parsed, inbound).await {
        Ok(MessagesReply::Unary { status, body }) => json_bytes_response(status, body),
        Ok(MessagesReply::Stream { subscriber }) => sse_response(subscriber),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn count_tokens(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: CountTokensBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "invalid request body: {err}"
            )));
        }
    };
    Json(state.orchestrator.count_tokens(&parsed)).into_response()
}

pub(crate) async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.orchestrator.config().snapshot();
    Json(json!({
        "status": "ok",
        "providers": snapshot.providers().len(),
    }))
    .into_response()
}

pub(crate) async fn providers(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.provider_snapshots()).into_response()
}

pub(crate) async fn reload(State(state): State<AppState>) -> Response {
    match state.orchestrator.reload_config() {
        Ok(()) => Json(json!({"status": "reloaded"})).into_response(),
        Err(err) => {
            warn!(event = "config.reload_rejected", error = %err);
            error_response(&ProxyError::invalid_request(format!(
                "config rejected: {err}"
            )))
        }
    }
}

pub(crate) async fn oauth_status(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.oauth().status().await).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeCodeBody {
    code: String,
    account_email: String,
}

pub(crate) async fn oauth_exchange_code(
    State(state): State<AppState>,
    Json(body): Json<ExchangeCodeBody>,
) -> Response {
    match state
        .orchestrator
        .oauth()
        .exchange_code(&body.code, &body.account_email)
        .await
    {
        Ok(()) => Json(json!({"status": "stored", "account_email": body.account_email}))
            .into_response(),
        Err(err) => error_response(&map_oauth_error(err)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RefreshBody {
    account_email: Option<String>,
}

pub(crate) async fn oauth_refresh(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: RefreshBody = if body.is_empty() {
        RefreshBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return error_response(&ProxyError::invalid_request(format!(
                    "invalid request body: {err}"
                )));
            }
        }
    };
    let oauth = state.orchestrator.oauth();
    let target = parsed.account_email;
    match target {
        Some(email) => match oauth.refresh(&email).await {
            Ok(()) => Json(json!({"status": "refreshed", "account_email": email})).into_response(),
            Err(err) => error_response(&map_oauth_error(err)),
        },
        None => {
            let results = oauth.refresh_all().await;
            let rows: Vec<_> = results
                .into_iter()
                .map(|(email, result)| {
                    json!({
                        "account_email": email,
                        "ok": result.is_ok(),
                        "error": result.err().map(|err| err.to_string()),
                    })
                })
                .collect();
            Json(json!({"results": rows})).into_response()
        }
    }
}

pub(crate) async fn oauth_delete(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Response {
    match state.orchestrator.oauth().delete(&email).await {
        Ok(()) => Json(json!({"status": "deleted", "account_email": email})).into_response(),
        Err(err) => error_response(&map_oauth_error(err)),
    }
}

pub(crate) async fn oauth_clear(State(state): State<AppState>) -> Response {
    match state.orchestrator.oauth().clear().await {
        Ok(()) => Json(json!({"status": "cleared"})).into_response(),
        Err(err) => error_response(&map_oauth_error(err)),
    }
}

fn map_oauth_error(err: OAuthError) -> ProxyError {
    match err {
        OAuthError::UnknownAccount(_) => ProxyError::not_found(err.to_string()),
        OAuthError::NoUsableTokens | OAuthError::MissingRefreshToken(_) => {
            ProxyError::invalid_request(err.to_string())
        }
        _ => ProxyError::api(err.to_string()),
    }
}

fn json_bytes_response(status: u16, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

const SSE_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

fn sse_response(mut subscriber: Subscriber) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate tick; the first heartbeat waits a full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                chunk = subscriber.next() => {
                    match chunk {
                        Ok(Some(chunk)) => {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        // Stream ended, or this client lagged past the
                        // backlog limit; both close the response body.
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Hint reverse proxies not to buffer the event stream.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
