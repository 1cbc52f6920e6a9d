use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use switchyard_core::client::{
    TransportFailure, UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse,
};
use switchyard_core::{MessagesReply, Orchestrator};
use switchyard_oauth::{MemoryStore, OAuthConfig, TokenManager};
use switchyard_pool::{ConfigStore, HealthEngine, TransportErrorKind};
use switchyard_protocol::anthropic::request::CreateMessageBody;
use switchyard_protocol::anthropic::types::{MessageContent, MessageParam, Role};
use switchyard_protocol::sse::SseParser;

#[derive(Clone)]
enum Scripted {
    Unary {
        status: u16,
        body: String,
        delay: Duration,
    },
    Stream {
        chunks: Vec<String>,
    },
    Transport(TransportErrorKind),
}

fn unary(status: u16, body: &str) -> Scripted {
    Scripted::Unary {
        status,
        body: body.to_string(),
        delay: Duration::ZERO,
    }
}

fn slow_unary(status: u16, body: &str, delay: Duration) -> Scripted {
    Scripted::Unary {
        status,
        body: body.to_string(),
        delay,
    }
}

fn stream(chunks: &[&str]) -> Scripted {
    Scripted::Stream {
        chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
    }
}

struct MockClient {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl MockClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, host: &str, scripted: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .push_back(scripted);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_for(&self, url: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().unwrap();
        let key = scripts
            .keys()
            .find(|host| url.contains(host.as_str()))?
            .clone();
        scripts.get_mut(&key)?.pop_front()
    }
}

impl UpstreamClient for MockClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.lock().unwrap().push(req.url.clone());
            let Some(scripted) = self.next_for(&req.url) else {
                return Err(TransportFailure {
                    kind: TransportErrorKind::Connect,
                    message: format!("no scripted response for {}", req.url),
                });
            };
            match scripted {
                Scripted::Unary {
                    status,
                    body,
                    delay,
                } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(UpstreamResponse {
                        status,
                        headers: Vec::new(),
                        body: UpstreamBody::Bytes(Bytes::from(body)),
                    })
                }
                Scripted::Stream { chunks } => {
                    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(Bytes::from(chunk)).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Scripted::Transport(kind) => Err(TransportFailure {
                    kind,
                    message: "scripted transport failure".to_string(),
                }),
            }
        })
    }
}

const CONFIG_TWO_ANTHROPIC: &str = r#"
providers:
  - name: a
    type: anthropic
    base_url: http://a.local
    auth_type: api_key
    auth_value: key-a
  - name: b
    type: anthropic
    base_url: http://b.local
    auth_type: api_key
    auth_value: key-b
model_routes:
  "claude-3-5-sonnet-*":
    - provider: a
      priority: 1
    - provider: b
      priority: 2
  "claude-3-5-haiku-*":
    - provider: a
      priority: 1
settings:
  unhealthy_threshold: 2
  failure_cooldown: 3600
  sticky_provider_duration: 0
  streaming_idle_timeout: 2
  streaming_total_timeout: 10
"#;

const CONFIG_OPENAI_BACKUP: &str = r#"
providers:
  - name: a
    type: anthropic
    base_url: http://a.local
    auth_type: api_key
    auth_value: key-a
  - name: o
    type: openai
    base_url: http://o.local
    auth_type: auth_token
    auth_value: sk-o
model_routes:
  "claude-*":
    - provider: a
      priority: 1
    - provider: o
      model: gpt-4o
      priority: 2
settings:
  unhealthy_threshold: 1
  failure_cooldown: 3600
  sticky_provider_duration: 0
  streaming_idle_timeout: 2
  streaming_total_timeout: 10
"#;

fn harness(config: &str, client: Arc<MockClient>) -> (Orchestrator, Arc<HealthEngine>) {
    let store = Arc::new(ConfigStore::from_str(config).unwrap());
    let health = Arc::new(HealthEngine::new());
    let oauth =
        TokenManager::new(OAuthConfig::default(), Arc::new(MemoryStore::new())).unwrap();
    (
        Orchestrator::new(store, health.clone(), oauth, client),
        health,
    )
}

fn body(model: &str, text: &str, stream: bool) -> CreateMessageBody {
    CreateMessageBody {
        model: model.to_string(),
        max_tokens: 64,
        messages: vec![MessageParam {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }],
        system: None,
        metadata: None,
        stop_sequences: None,
        stream: stream.then_some(true),
        temperature: None,
        tool_choice: None,
        tools: None,
        top_k: None,
        top_p: None,
    }
}

const ANTHROPIC_OK: &str = r#"{"id":"msg_up1","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[{"type":"text","text":"from upstream"}],"stop_reason":"end_turn","stop_sequence":null,"usage":{"input_tokens":3,"output_tokens":2}}"#;

const API_ERROR_500: &str = r#"{"type":"error","error":{"type":"api_error","message":"boom"}}"#;

const AUTH_ERROR_401: &str =
    r#"{"type":"error","error":{"type":"authentication_error","message":"bad key"}}"#;

async fn unary_reply(
    orchestrator: &Orchestrator,
    request: CreateMessageBody,
) -> (u16, Bytes) {
    match orchestrator.handle_messages(request, None).await.unwrap() {
        MessagesReply::Unary { status, body } => (status, body),
        MessagesReply::Stream { .. } => panic!("expected unary reply"),
    }
}

async fn collect_stream(reply: MessagesReply) -> Vec<(Option<String>, String)> {
    let MessagesReply::Stream { mut subscriber } = reply else {
        panic!("expected stream reply");
    };
    let mut parser = SseParser::new();
    let mut events = Vec::new();
    while let Some(chunk) = timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("stream stalled")
        .expect("subscriber lagged")
    {
        for event in parser.feed(&chunk) {
            events.push((event.event, event.data));
        }
    }
    events
}

#[tokio::test]
async fn priority_failover_on_server_error() {
    let client = MockClient::new();
    client.script("a.local", unary(500, API_ERROR_500));
    client.script("b.local", unary(200, ANTHROPIC_OK));
    let (orchestrator, health) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    let (status, reply) =
        unary_reply(&orchestrator, body("claude-3-5-sonnet-20241022", "hi", false)).await;
    assert_eq!(status, 200);
    assert_eq!(reply, Bytes::from(ANTHROPIC_OK));
    assert_eq!(client.calls().len(), 2);
    assert!(client.calls()[0].contains("a.local"));
    assert!(client.calls()[1].contains("b.local"));
    assert_eq!(health.error_count("a"), 1);
}

#[tokio::test]
async fn threshold_marks_provider_and_later_calls_skip_it() {
    let client = MockClient::new();
    client.script("a.local", unary(500, API_ERROR_500));
    client.script("a.local", unary(500, API_ERROR_500));
    for _ in 0..3 {
        client.script("b.local", unary(200, ANTHROPIC_OK));
    }
    let (orchestrator, health) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    for text in ["one", "two", "three"] {
        let (status, _) =
            unary_reply(&orchestrator, body("claude-3-5-sonnet-20241022", text, false)).await;
        assert_eq!(status, 200);
    }

    // a was tried for the first two calls, then marked unhealthy and skipped.
    let a_calls = client
        .calls()
        .iter()
        .filter(|url| url.contains("a.local"))
        .count();
    assert_eq!(a_calls, 2);
    assert_eq!(health.error_count("a"), 2);
}

#[tokio::test]
async fn concurrent_duplicates_share_one_upstream_call() {
    let client = MockClient::new();
    client.script(
        "a.local",
        slow_unary(200, ANTHROPIC_OK, Duration::from_millis(50)),
    );
    let (orchestrator, _) = harness(CONFIG_TWO_ANTHROPIC, client.clone());
    let orchestrator = Arc::new(orchestrator);

    let request = body("claude-3-5-haiku-20241022", "dup", false);
    let first = {
        let orchestrator = orchestrator.clone();
        let request = request.clone();
        tokio::spawn(async move { orchestrator.handle_messages(request, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = orchestrator.handle_messages(request, None).await.unwrap();

    let first = first.await.unwrap().unwrap();
    let (MessagesReply::Unary { body: body_a, .. }, MessagesReply::Unary { body: body_b, .. }) =
        (first, second)
    else {
        panic!("expected unary replies");
    };
    assert_eq!(body_a, body_b);
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test]
async fn streaming_error_before_first_byte_fails_over() {
    let client = MockClient::new();
    client.script(
        "a.local",
        stream(&[
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"busy\"}}\n\n",
        ]),
    );
    client.script(
        "b.local",
        stream(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_b\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-sonnet-20241022\",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":1,\"output_tokens\":0}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]),
    );
    let (orchestrator, health) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    let reply = orchestrator
        .handle_messages(body("claude-3-5-sonnet-20241022", "s", true), None)
        .await
        .unwrap();
    let events = collect_stream(reply).await;

    assert_eq!(client.calls().len(), 2);
    assert!(events.iter().all(|(name, _)| name.as_deref() != Some("error")));
    assert_eq!(events.first().unwrap().0.as_deref(), Some("message_start"));
    assert_eq!(events.last().unwrap().0.as_deref(), Some("message_stop"));
    assert_eq!(health.error_count("a"), 1);
}

#[tokio::test]
async fn openai_stream_is_translated_to_anthropic_events() {
    let client = MockClient::new();
    client.script("a.local", unary(500, API_ERROR_500));
    client.script(
        "o.local",
        stream(&[
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]),
    );
    let (orchestrator, _) = harness(CONFIG_OPENAI_BACKUP, client.clone());

    let reply = orchestrator
        .handle_messages(body("claude-3-5-sonnet-20241022", "s2", true), None)
        .await
        .unwrap();
    let events = collect_stream(reply).await;

    let names: Vec<&str> = events
        .iter()
        .filter_map(|(name, _)| name.as_deref())
        .collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let text: String = events
        .iter()
        .filter(|(name, _)| name.as_deref() == Some("content_block_delta"))
        .filter_map(|(_, data)| {
            serde_json::from_str::<serde_json::Value>(data)
                .ok()?
                .pointer("/delta/text")
                .and_then(|text| text.as_str())
                .map(str::to_string)
        })
        .collect();
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn openai_unary_response_is_translated() {
    let client = MockClient::new();
    client.script("a.local", Scripted::Transport(TransportErrorKind::Connect));
    client.script(
        "o.local",
        unary(
            200,
            r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","content":"translated"},"finish_reason":"stop"}],"usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}"#,
        ),
    );
    let (orchestrator, _) = harness(CONFIG_OPENAI_BACKUP, client.clone());

    let (status, reply) =
        unary_reply(&orchestrator, body("claude-3-5-sonnet-20241022", "t", false)).await;
    assert_eq!(status, 200);
    let message: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(message["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(message["content"][0]["text"], "translated");
    assert_eq!(message["stop_reason"], "end_turn");
    assert_eq!(message["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn auth_errors_surface_without_failover() {
    let client = MockClient::new();
    client.script("a.local", unary(401, AUTH_ERROR_401));
    let (orchestrator, health) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    let (status, reply) =
        unary_reply(&orchestrator, body("claude-3-5-sonnet-20241022", "x", false)).await;
    assert_eq!(status, 401);
    assert_eq!(reply, Bytes::from(AUTH_ERROR_401));
    assert_eq!(client.calls().len(), 1);
    assert_eq!(health.error_count("a"), 0);
}

#[tokio::test]
async fn unknown_model_is_a_not_found_error() {
    let client = MockClient::new();
    let (orchestrator, _) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    let err = orchestrator
        .handle_messages(body("gemini-pro", "x", false), None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn exhaustion_returns_aggregated_error() {
    let client = MockClient::new();
    client.script("a.local", unary(503, API_ERROR_500));
    client.script("b.local", Scripted::Transport(TransportErrorKind::Timeout));
    let (orchestrator, _) = harness(CONFIG_TWO_ANTHROPIC, client.clone());

    let err = orchestrator
        .handle_messages(body("claude-3-5-sonnet-20241022", "x", false), None)
        .await
        .unwrap_err();
    assert_eq!(client.calls().len(), 2);
    assert!(err.message.contains("2 provider attempt(s)"));
}

#[tokio::test]
async fn concurrent_stream_duplicates_share_one_broadcast() {
    let client = MockClient::new();
    client.script(
        "a.local",
        stream(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_a\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-haiku-20241022\",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":1,\"output_tokens\":0}}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]),
    );
    let (orchestrator, _) = harness(CONFIG_TWO_ANTHROPIC, client.clone());
    let orchestrator = Arc::new(orchestrator);

    let request = body("claude-3-5-haiku-20241022", "sdup", true);
    let first = {
        let orchestrator = orchestrator.clone();
        let request = request.clone();
        tokio::spawn(async move { orchestrator.handle_messages(request, None).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = orchestrator.handle_messages(request, None).await.unwrap();

    let events_a = collect_stream(first.await.unwrap()).await;
    let events_b = collect_stream(second).await;
    assert_eq!(events_a, events_b);
    assert_eq!(client.calls().len(), 1);
}
