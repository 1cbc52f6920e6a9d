use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, warn};

use switchyard_pool::{
    ConfigSnapshot, FailureKind, HealthEngine, Outcome, Provider, ProviderKind,
    TransportErrorKind,
};
use switchyard_protocol::anthropic::error::{ErrorDetail, ErrorType};
use switchyard_protocol::anthropic::stream::StreamEvent;
use switchyard_protocol::openai::SSE_DONE;
use switchyard_protocol::openai::stream::ChatCompletionChunk;
use switchyard_protocol::sse::{self, SseEvent, SseParser};
use switchyard_transform::stream::OpenAiToAnthropicStream;

use crate::broadcast::{Broadcaster, StreamOutcome};
use crate::client::ByteStream;
use crate::error::ProxyError;
use crate::orchestrator::{AttemptOutcome, error_body_bytes};

/// Open a live upstream stream: pre-read a lookahead to allow failover on an
/// immediate error event, then hand the rest to a background pump that fills
/// the broadcaster with normalized Anthropic SSE frames.
pub(crate) async fn start_stream(
    health: Arc<HealthEngine>,
    snapshot: Arc<ConfigSnapshot>,
    provider: Arc<Provider>,
    client_model: String,
    mut rx: ByteStream,
    permit: OwnedSemaphorePermit,
) -> AttemptOutcome {
    let idle = snapshot.settings.streaming_idle_timeout();
    let mut parser = SseParser::new();
    let mut pending: Vec<SseEvent> = Vec::new();
    let mut upstream_closed = false;

    // No byte has reached the client yet, so waiting for the first event
    // keeps failover possible.
    while pending.is_empty() {
        match tokio::time::timeout(idle, rx.recv()).await {
            Err(_) => {
                let err = ProxyError::timeout("upstream sent no stream data");
                return AttemptOutcome::Failed {
                    kind: Some(FailureKind::Transport(TransportErrorKind::ReadTimeout)),
                    status: err.status(),
                    body: error_body_bytes(err.body()),
                };
            }
            Ok(None) => {
                pending.extend(parser.finish());
                upstream_closed = true;
                break;
            }
            Ok(Some(chunk)) => pending.extend(parser.feed(&chunk)),
        }
    }

    if pending.is_empty() {
        let err = ProxyError::api("upstream closed the stream before sending any event");
        return AttemptOutcome::Failed {
            kind: Some(FailureKind::SseError("empty stream".to_string())),
            status: err.status(),
            body: error_body_bytes(err.body()),
        };
    }

    if let Some(detail) = immediate_error(&pending[0], provider.kind) {
        debug!(event = "stream.lookahead_error", provider = %provider.name, detail = %detail);
        let err = ProxyError::api(format!("upstream stream opened with an error: {detail}"));
        return AttemptOutcome::Failed {
            kind: Some(FailureKind::SseError(detail)),
            status: err.status(),
            body: error_body_bytes(err.body()),
        };
    }

    let broadcaster = Broadcaster::new(snapshot.settings.subscriber_backlog_max);
    let translator = (provider.kind == ProviderKind::Openai)
        .then(|| OpenAiToAnthropicStream::new(client_model));
    let pump = Pump {
        health,
        snapshot,
        provider,
        broadcaster: broadcaster.clone(),
        translator,
        error_seen: None,
        done: false,
    };
    tokio::spawn(pump.run(parser, pending, rx, upstream_closed, idle, permit));

    AttemptOutcome::Stream { broadcaster }
}

/// True error payloads arriving as a stream event, per wire dialect.
fn immediate_error(event: &SseEvent, kind: ProviderKind) -> Option<String> {
    match kind {
        ProviderKind::Anthropic => {
            if event.is_named("error") {
                return Some(event.data.clone());
            }
            let value: serde_json::Value = serde_json::from_str(&event.data).ok()?;
            (value.get("type").and_then(|t| t.as_str()) == Some("error"))
                .then(|| event.data.clone())
        }
        ProviderKind::Openai => {
            let value: serde_json::Value = serde_json::from_str(&event.data).ok()?;
            value
                .get("error")
                .filter(|error| !error.is_null())
                .map(|error| error.to_string())
        }
    }
}

struct Pump {
    health: Arc<HealthEngine>,
    snapshot: Arc<ConfigSnapshot>,
    provider: Arc<Provider>,
    broadcaster: Arc<Broadcaster>,
    translator: Option<OpenAiToAnthropicStream>,
    error_seen: Option<String>,
    done: bool,
}

impl Pump {
    async fn run(
        mut self,
        mut parser: SseParser,
        pending: Vec<SseEvent>,
        mut rx: ByteStream,
        upstream_closed: bool,
        idle: Duration,
        permit: OwnedSemaphorePermit,
    ) {
        let deadline = Instant::now() + self.snapshot.settings.streaming_total_timeout();

        for event in pending {
            self.handle_event(event);
        }

        let outcome = if upstream_closed || self.done || self.error_seen.is_some() {
            self.close()
        } else {
            loop {
                if self.broadcaster.should_cancel_upstream() {
                    break StreamOutcome::Cancelled;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.push_error_event(
                        ErrorType::TimeoutError,
                        "stream exceeded the total duration limit",
                    );
                    break StreamOutcome::TotalTimeout;
                }
                match tokio::time::timeout(remaining.min(idle), rx.recv()).await {
                    Err(_) => {
                        if deadline.saturating_duration_since(Instant::now()).is_zero() {
                            self.push_error_event(
                                ErrorType::TimeoutError,
                                "stream exceeded the total duration limit",
                            );
                            break StreamOutcome::TotalTimeout;
                        }
                        self.push_error_event(
                            ErrorType::TimeoutError,
                            "upstream went idle mid-stream",
                        );
                        break StreamOutcome::IdleTimeout;
                    }
                    Ok(None) => {
                        for event in parser.finish() {
                            self.handle_event(event);
                        }
                        break self.close();
                    }
                    Ok(Some(chunk)) => {
                        for event in parser.feed(&chunk) {
                            self.handle_event(event);
                        }
                        if self.done || self.error_seen.is_some() {
                            break self.close();
                        }
                    }
                }
            }
        };

        self.broadcaster.finish(outcome.clone());
        self.record(outcome);
        drop(permit);
    }

    fn handle_event(&mut self, event: SseEvent) {
        if self.done || self.error_seen.is_some() {
            return;
        }
        match &mut self.translator {
            // Anthropic upstream: frames pass through re-encoded; a terminal
            // error event is forwarded and remembered for health accounting.
            None => {
                if let Some(detail) = immediate_error(&event, ProviderKind::Anthropic) {
                    self.error_seen = Some(detail);
                }
                self.broadcaster
                    .push(sse::encode(event.event.as_deref(), &event.data));
            }
            Some(translator) => {
                if event.data == SSE_DONE {
                    let events = translator.finish();
                    self.done = true;
                    self.push_events(&events);
                    return;
                }
                match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                    Ok(chunk) => {
                        let events = translator.transform_chunk(&chunk);
                        self.push_events(&events);
                    }
                    Err(_) => {
                        // Unknown frames are skipped; an error payload ends
                        // the stream inline.
                        if let Some(detail) = immediate_error(&event, ProviderKind::Openai) {
                            self.push_error_event(ErrorType::ApiError, &detail);
                            self.error_seen = Some(detail);
                        }
                    }
                }
            }
        }
    }

    /// Terminal bookkeeping once the upstream is done: flush the translator's
    /// closing events and fold the observed error into the outcome.
    fn close(&mut self) -> StreamOutcome {
        if let Some(mut translator) = self.translator.take()
            && !self.done
            && self.error_seen.is_none()
        {
            let events = translator.finish();
            self.push_events(&events);
        }
        match self.error_seen.take() {
            Some(detail) => StreamOutcome::Error(detail),
            None => StreamOutcome::Completed,
        }
    }

    fn push_events(&self, events: &[StreamEvent]) {
        for event in events {
            match event.to_sse() {
                Ok(frame) => self.broadcaster.push(Bytes::from(frame)),
                Err(err) => warn!(event = "stream.encode_failed", error = %err),
            }
        }
    }

    fn push_error_event(&self, error_type: ErrorType, message: &str) {
        let event = StreamEvent::Error {
            error: ErrorDetail {
                r#type: error_type,
                message: message.to_string(),
            },
        };
        if let Ok(frame) = event.to_sse() {
            self.broadcaster.push(Bytes::from(frame));
        }
    }

    fn record(&self, outcome: StreamOutcome) {
        let settings = &self.snapshot.settings;
        let provider = self.provider.name.as_str();
        let health_outcome = match outcome {
            StreamOutcome::Completed => Outcome::Success,
            StreamOutcome::IdleTimeout => {
                Outcome::Failure(FailureKind::Transport(TransportErrorKind::ReadTimeout))
            }
            StreamOutcome::TotalTimeout => {
                Outcome::Failure(FailureKind::Transport(TransportErrorKind::Timeout))
            }
            StreamOutcome::Error(detail) => Outcome::Failure(FailureKind::SseError(detail)),
            StreamOutcome::Cancelled => return,
        };
        self.health
            .record_outcome(provider, health_outcome, settings);
    }
}
