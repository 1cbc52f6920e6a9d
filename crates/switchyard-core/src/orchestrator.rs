use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use switchyard_oauth::TokenManager;
use switchyard_pool::{
    AuthSource, AuthType, Candidate, ConfigError, ConfigSnapshot, ConfigStore, FailureKind,
    HealthEngine, Outcome, Provider, ProviderHealthSnapshot, ProviderKind, SelectError,
    TransportErrorKind, evaluate_response, select_candidates,
};
use switchyard_protocol::anthropic::count_tokens::{CountTokensBody, CountTokensResponse};
use switchyard_protocol::anthropic::error::{ErrorBody, ErrorType};
use switchyard_protocol::anthropic::request::CreateMessageBody;
use switchyard_protocol::openai::response::ChatCompletionResponse;
use switchyard_transform::context::ToolNameMap;
use switchyard_transform::{request as request_xform, response as response_xform, tokens};

use crate::broadcast::Subscriber;
use crate::client::{UpstreamBody, UpstreamClient, UpstreamRequest};
use crate::dedup::{BeginRole, DedupRegistry, SharedOutcome, SharedResponse};
use crate::error::ProxyError;
use crate::fingerprint::fingerprint;
use crate::stream_pump;

/// How much of a response body is decoded for health probing.
const BODY_PREVIEW_BYTES: usize = 8 * 1024;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// The orchestrator's answer for one inbound Messages call.
pub enum MessagesReply {
    /// Complete Anthropic-format JSON body (success or verbatim error).
    Unary { status: u16, body: Bytes },
    /// Attached cursor over the normalized Anthropic SSE stream.
    Stream { subscriber: Subscriber },
}

pub(crate) enum AttemptOutcome {
    Unary {
        status: u16,
        body: Bytes,
    },
    Stream {
        broadcaster: Arc<crate::broadcast::Broadcaster>,
    },
    /// The candidate failed. Qualifying failures rotate to the next
    /// candidate; surface failures are returned to the client verbatim.
    Failed {
        kind: Option<FailureKind>,
        status: u16,
        body: Bytes,
    },
    /// Local impediment (no OAuth token, etc.); try the next candidate
    /// without touching the provider's health.
    Skip {
        reason: String,
    },
}

enum ResolvedAuth {
    Headers(Vec<(String, String)>),
    Surface(ProxyError),
    Skip(String),
}

/// End-to-end pipeline: dedup → select → per-candidate call/translate/probe →
/// failover → reply.
pub struct Orchestrator {
    config: Arc<ConfigStore>,
    health: Arc<HealthEngine>,
    oauth: TokenManager,
    dedup: DedupRegistry,
    client: Arc<dyn UpstreamClient>,
    /// Per-provider connection limiter; permits are held for a call's whole
    /// lifetime, including the background pump of a stream.
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        health: Arc<HealthEngine>,
        oauth: TokenManager,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            config,
            health,
            oauth,
            dedup: DedupRegistry::new(),
            client,
            limits: Mutex::new(HashMap::new()),
        }
    }

    fn limiter(&self, provider: &str, permits: usize) -> Arc<Semaphore> {
        let mut limits = self
            .limits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        limits
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1))))
            .clone()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn oauth(&self) -> &TokenManager {
        &self.oauth
    }

    pub fn reload_config(&self) -> Result<(), ConfigError> {
        self.config.reload()
    }

    pub fn provider_snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        let snapshot = self.config.snapshot();
        snapshot
            .providers()
            .iter()
            .map(|provider| self.health.snapshot_for(provider))
            .collect()
    }

    pub fn count_tokens(&self, body: &CountTokensBody) -> CountTokensResponse {
        CountTokensResponse {
            input_tokens: tokens::count_request_tokens(body),
        }
    }

    /// Handle one inbound Messages request. `inbound_credential` is the
    /// client's own key, used only for passthrough providers.
    pub async fn handle_messages(
        &self,
        body: CreateMessageBody,
        inbound_credential: Option<String>,
    ) -> Result<MessagesReply, ProxyError> {
        let snapshot = self.config.snapshot();
        let settings = &snapshot.settings;

        let fp = settings
            .deduplication_enabled
            .then(|| fingerprint(&body));
        if let Some(fp) = &fp {
            match self.dedup.begin(fp, settings.deduplication_ttl()) {
                BeginRole::Owner => {}
                BeginRole::Wait(rx) => {
                    debug!(event = "orchestrator.duplicate_wait", fingerprint = %fp);
                    return match rx.await {
                        Ok(SharedOutcome::Unary(shared)) => Ok(MessagesReply::Unary {
                            status: shared.status,
                            body: shared.body,
                        }),
                        Ok(SharedOutcome::Stream(broadcaster)) => Ok(MessagesReply::Stream {
                            subscriber: broadcaster.subscribe(),
                        }),
                        Err(_) => Err(ProxyError::api(
                            "the original request was abandoned before completing",
                        )),
                    };
                }
                BeginRole::Join(broadcaster) => {
                    debug!(event = "orchestrator.duplicate_join", fingerprint = %fp);
                    return Ok(MessagesReply::Stream {
                        subscriber: broadcaster.subscribe(),
                    });
                }
            }
        }

        let guard = OwnerGuard {
            dedup: &self.dedup,
            fingerprint: fp.clone(),
        };
        let result = self
            .run_owner(&snapshot, body, inbound_credential, fp.as_deref())
            .await;
        match &result {
            Ok(_) => guard.disarm(),
            Err(err) => {
                if let Some(fp) = &fp {
                    self.dedup.fail(
                        fp,
                        SharedResponse {
                            status: err.status(),
                            body: error_body_bytes(err.body()),
                        },
                    );
                }
                guard.disarm();
            }
        }
        result
    }

    async fn run_owner(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        body: CreateMessageBody,
        inbound_credential: Option<String>,
        fp: Option<&str>,
    ) -> Result<MessagesReply, ProxyError> {
        let settings = &snapshot.settings;
        let candidates = select_candidates(&self.health, snapshot, &body.model).map_err(
            |err| match err {
                SelectError::NoRoute => {
                    ProxyError::not_found(format!("no route matches model {}", body.model))
                }
                SelectError::AllUnhealthy => ProxyError::overloaded(format!(
                    "all providers for model {} are unavailable",
                    body.model
                )),
            },
        )?;

        let total = candidates.len();
        let mut last_failure: Option<FailureKind> = None;
        let mut attempts = 0usize;

        for candidate in candidates {
            attempts += 1;
            let provider = candidate.provider.name.clone();
            debug!(
                event = "orchestrator.attempt",
                provider = %provider,
                model = %candidate.upstream_model,
                attempt = attempts,
                of = total,
            );
            let outcome = self
                .attempt(snapshot, &candidate, &body, inbound_credential.as_deref())
                .await;
            match outcome {
                AttemptOutcome::Unary { status, body } => {
                    self.health
                        .record_outcome(&provider, Outcome::Success, settings);
                    if let Some(fp) = fp {
                        self.dedup.complete(
                            fp,
                            SharedResponse {
                                status,
                                body: body.clone(),
                            },
                        );
                    }
                    info!(event = "orchestrator.served", provider = %provider, status);
                    return Ok(MessagesReply::Unary { status, body });
                }
                AttemptOutcome::Stream { broadcaster } => {
                    // Subscribe before publishing so the subscriber count is
                    // never observed at zero while this client is attached.
                    let subscriber = broadcaster.subscribe();
                    if let Some(fp) = fp {
                        self.dedup.publish_stream(fp, broadcaster.clone());
                    }
                    broadcaster.mark_primary_recorded();
                    info!(event = "orchestrator.stream_started", provider = %provider);
                    return Ok(MessagesReply::Stream { subscriber });
                }
                AttemptOutcome::Failed { kind, status, body } => match kind {
                    Some(kind) if kind.is_qualifying() => {
                        let marked = self.health.record_outcome(
                            &provider,
                            Outcome::Failure(kind.clone()),
                            settings,
                        );
                        warn!(
                            event = "orchestrator.attempt_failed",
                            provider = %provider,
                            reason = %kind,
                            marked_unhealthy = marked,
                            remaining = total - attempts,
                        );
                        last_failure = Some(kind);
                    }
                    _ => {
                        // Auth and validation errors from the upstream are
                        // returned verbatim; retrying another provider will
                        // not change the answer.
                        if let Some(fp) = fp {
                            self.dedup.fail(
                                fp,
                                SharedResponse {
                                    status,
                                    body: body.clone(),
                                },
                            );
                        }
                        return Ok(MessagesReply::Unary { status, body });
                    }
                },
                AttemptOutcome::Skip { reason } => {
                    warn!(event = "orchestrator.attempt_skipped", provider = %provider, reason = %reason);
                }
            }
        }

        let category = last_failure
            .as_ref()
            .map(exhaustion_category)
            .unwrap_or(ErrorType::OverloadedError);
        Err(ProxyError::new(
            category,
            format!(
                "all {attempts} provider attempt(s) failed; last error: {}",
                last_failure
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "no candidate was attempted".to_string())
            ),
        ))
    }

    async fn attempt(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        candidate: &Candidate,
        body: &CreateMessageBody,
        inbound_credential: Option<&str>,
    ) -> AttemptOutcome {
        let provider = &candidate.provider;
        let settings = &snapshot.settings;
        let is_stream = body.is_stream();

        let limiter = self.limiter(&provider.name, settings.max_provider_connections);
        let Ok(permit) = limiter.acquire_owned().await else {
            return AttemptOutcome::Skip {
                reason: "connection limiter closed".to_string(),
            };
        };

        let headers = match self.resolve_auth(provider, inbound_credential).await {
            ResolvedAuth::Headers(headers) => headers,
            ResolvedAuth::Surface(err) => {
                return AttemptOutcome::Failed {
                    kind: None,
                    status: err.status(),
                    body: error_body_bytes(err.body()),
                };
            }
            ResolvedAuth::Skip(reason) => return AttemptOutcome::Skip { reason },
        };

        let outbound = match outbound_body(provider, body, &candidate.upstream_model) {
            Ok(outbound) => outbound,
            Err(err) => {
                return AttemptOutcome::Skip {
                    reason: format!("request translation failed: {err}"),
                };
            }
        };

        let request = UpstreamRequest {
            url: messages_url(provider),
            headers,
            body: outbound,
            is_stream,
            proxy: provider.http_proxy.clone(),
            request_timeout: settings.request_timeout(),
            idle_timeout: settings.streaming_idle_timeout(),
        };

        let response = match self.client.send(request).await {
            Ok(response) => response,
            Err(failure) => {
                let kind = FailureKind::Transport(failure.kind);
                let err = transport_error(&failure.kind, &failure.message);
                return AttemptOutcome::Failed {
                    kind: Some(kind),
                    status: err.status(),
                    body: error_body_bytes(err.body()),
                };
            }
        };

        match response.body {
            UpstreamBody::Bytes(bytes) => {
                self.judge_unary(snapshot, provider, body, response.status, bytes)
            }
            UpstreamBody::Stream(rx) => {
                // The permit travels with the pump and is released when the
                // stream terminates.
                stream_pump::start_stream(
                    self.health.clone(),
                    snapshot.clone(),
                    provider.clone(),
                    body.model.clone(),
                    rx,
                    permit,
                )
                .await
            }
        }
    }

    /// Health-probe a fully read response body, then translate it for the
    /// client.
    fn judge_unary(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        provider: &Arc<Provider>,
        body: &CreateMessageBody,
        status: u16,
        bytes: Bytes,
    ) -> AttemptOutcome {
        let preview_len = bytes.len().min(BODY_PREVIEW_BYTES);
        let preview = String::from_utf8_lossy(&bytes[..preview_len]);
        if let Some(kind) = evaluate_response(status, &preview, snapshot) {
            return AttemptOutcome::Failed {
                kind: Some(kind),
                status,
                body: bytes,
            };
        }
        if !(200..300).contains(&status) {
            // An error the health rules do not count (401, 400 validation):
            // surface it unchanged.
            return AttemptOutcome::Failed {
                kind: None,
                status,
                body: bytes,
            };
        }

        match provider.kind {
            ProviderKind::Anthropic => AttemptOutcome::Unary {
                status,
                body: bytes,
            },
            ProviderKind::Openai => {
                let parsed: ChatCompletionResponse = match serde_json::from_slice(&bytes) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(
                            event = "orchestrator.malformed_response",
                            provider = %provider.name,
                            error = %err,
                        );
                        let proxy_err =
                            ProxyError::api("upstream returned an undecodable response");
                        return AttemptOutcome::Failed {
                            kind: Some(FailureKind::MalformedResponse),
                            status: proxy_err.status(),
                            body: error_body_bytes(proxy_err.body()),
                        };
                    }
                };
                let mut names = ToolNameMap::new();
                let message = response_xform::openai_to_anthropic(&parsed, &body.model, &mut names);
                match serde_json::to_vec(&message) {
                    Ok(json) => AttemptOutcome::Unary {
                        status: 200,
                        body: Bytes::from(json),
                    },
                    Err(err) => AttemptOutcome::Skip {
                        reason: format!("response serialization failed: {err}"),
                    },
                }
            }
        }
    }

    async fn resolve_auth(
        &self,
        provider: &Provider,
        inbound_credential: Option<&str>,
    ) -> ResolvedAuth {
        let mut oauth_issued = false;
        let secret = match &provider.auth_source {
            AuthSource::Static(value) => value.clone(),
            AuthSource::Passthrough => match inbound_credential {
                Some(value) => value.to_string(),
                None => {
                    return ResolvedAuth::Surface(ProxyError::authentication(
                        "provider expects the client credential to be forwarded, but none was sent",
                    ));
                }
            },
            AuthSource::OAuth => match self.oauth.issue_token().await {
                Ok((access_token, account)) => {
                    debug!(event = "orchestrator.oauth_token", account = %account, provider = %provider.name);
                    oauth_issued = true;
                    access_token
                }
                Err(err) => return ResolvedAuth::Skip(format!("oauth unavailable: {err}")),
            },
        };

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        match provider.auth_type {
            AuthType::ApiKey => headers.push(("x-api-key".to_string(), secret)),
            AuthType::AuthToken | AuthType::Oauth => {
                headers.push(("authorization".to_string(), format!("Bearer {secret}")));
            }
        }
        if provider.kind == ProviderKind::Anthropic {
            headers.push((
                "anthropic-version".to_string(),
                ANTHROPIC_VERSION.to_string(),
            ));
            if oauth_issued {
                headers.push(("anthropic-beta".to_string(), OAUTH_BETA.to_string()));
            }
        }
        ResolvedAuth::Headers(headers)
    }
}

/// Removes the dedup entry if the owner future is dropped before settling,
/// so waiters fail fast instead of wedging until the TTL.
struct OwnerGuard<'a> {
    dedup: &'a DedupRegistry,
    fingerprint: Option<String>,
}

impl OwnerGuard<'_> {
    fn disarm(mut self) {
        self.fingerprint = None;
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if let Some(fp) = self.fingerprint.take() {
            self.dedup.abandon(&fp);
        }
    }
}

fn messages_url(provider: &Provider) -> String {
    match provider.kind {
        ProviderKind::Anthropic => format!("{}/v1/messages", provider.base_url),
        ProviderKind::Openai => format!("{}/v1/chat/completions", provider.base_url),
    }
}

fn outbound_body(
    provider: &Provider,
    body: &CreateMessageBody,
    upstream_model: &str,
) -> Result<Bytes, serde_json::Error> {
    let json = match provider.kind {
        ProviderKind::Anthropic => {
            let mut outbound = body.clone();
            outbound.model = upstream_model.to_string();
            serde_json::to_vec(&outbound)?
        }
        ProviderKind::Openai => {
            let outbound = request_xform::anthropic_to_openai(body, upstream_model);
            serde_json::to_vec(&outbound)?
        }
    };
    Ok(Bytes::from(json))
}

fn transport_error(kind: &TransportErrorKind, message: &str) -> ProxyError {
    match kind {
        TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => {
            ProxyError::timeout(format!("upstream timed out: {message}"))
        }
        _ => ProxyError::api(format!("upstream connection failed: {message}")),
    }
}

fn exhaustion_category(kind: &FailureKind) -> ErrorType {
    match kind {
        FailureKind::HttpStatus(429) => ErrorType::RateLimitError,
        FailureKind::Transport(TransportErrorKind::Timeout)
        | FailureKind::Transport(TransportErrorKind::ReadTimeout) => ErrorType::TimeoutError,
        FailureKind::BodyPattern(_) | FailureKind::SseError(_) => ErrorType::OverloadedError,
        FailureKind::HttpStatus(_) | FailureKind::Transport(_) | FailureKind::MalformedResponse => {
            ErrorType::ApiError
        }
    }
}

pub(crate) fn error_body_bytes(body: ErrorBody) -> Bytes {
    Bytes::from(serde_json::to_vec(&body).unwrap_or_else(|_| {
        br#"{"type":"error","error":{"type":"api_error","message":"error"}}"#.to_vec()
    }))
}
