use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, header};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use switchyard_core::ProxyError;

use crate::AppState;
use crate::handlers::error_response;

/// Inbound API-key check. Accepts `x-api-key` first, then a bearer token;
/// exempt path prefixes bypass the gate entirely.
pub async fn gate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let snapshot = state.orchestrator.config().snapshot();
    let auth = &snapshot.settings.auth;
    if !auth.enabled || is_exempt(request.uri().path(), &auth.exempt_paths) {
        return next.run(request).await;
    }

    match client_credential(request.headers()) {
        Some(provided) if provided == auth.api_key => next.run(request).await,
        Some(_) => {
            debug!(event = "auth.rejected", path = %request.uri().path());
            error_response(&ProxyError::authentication("invalid api key"))
        }
        None => error_response(&ProxyError::authentication(
            "missing x-api-key or authorization header",
        )),
    }
}

fn is_exempt(path: &str, exempt: &[String]) -> bool {
    exempt.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// The credential the client presented, if any. Also used by the orchestrator
/// for passthrough providers.
pub fn client_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key")
        && let Ok(value) = value.to_str()
    {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
        let token = value[7..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}
