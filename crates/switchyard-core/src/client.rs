use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Proxy};

use switchyard_pool::TransportErrorKind;

pub type Headers = Vec<(String, String)>;
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub is_stream: bool,
    pub proxy: Option<String>,
    /// Bounds the whole exchange for unary calls and the header/handshake
    /// phase for streams.
    pub request_timeout: Duration,
    /// Per-chunk gap allowance while bridging a stream body.
    pub idle_timeout: Duration,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport failure ({kind:?}): {message}")]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportFailure>> + Send + 'a>>;
}

/// wreq-backed client pool, one client per outbound proxy value.
pub struct HttpClientPool {
    connect_timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl HttpClientPool {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, TransportFailure> {
        let key = proxy
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let mut guard = lock(&self.clients);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder().connect_timeout(self.connect_timeout);
        if let Some(proxy) = &key {
            builder = builder.proxy(Proxy::all(proxy).map_err(transport_failure)?);
        }
        let client = builder.build().map_err(transport_failure)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient for HttpClientPool {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client_for(req.proxy.as_deref())?;
            let mut builder = client.post(&req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            let send = async {
                let response = builder
                    .body(req.body.clone())
                    .send()
                    .await
                    .map_err(transport_failure)?;
                convert_response(response, req.is_stream, req.idle_timeout).await
            };
            match tokio::time::timeout(req.request_timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(TransportFailure {
                    kind: TransportErrorKind::Timeout,
                    message: format!("request timed out after {:?}", req.request_timeout),
                }),
            }
        })
    }
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
    idle_timeout: Duration,
) -> Result<UpstreamResponse, TransportFailure> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    // Error responses are read whole even for stream requests so the body can
    // be probed for health classification.
    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = response.bytes().await.map_err(transport_failure)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let Ok(item) = next else {
                break;
            };
            let Some(item) = item else {
                break;
            };
            let Ok(chunk) = item else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

/// Classification is keyword-driven and owned by the pool crate, so the
/// health engine and this client agree on what each failure text means. The
/// one signal the text cannot carry, a client-side timer expiring, comes from
/// the error itself.
fn transport_failure(err: wreq::Error) -> TransportFailure {
    let message = err.to_string();
    let kind = TransportErrorKind::parse(&message)
        .or_else(|| err.is_timeout().then_some(TransportErrorKind::Timeout))
        .unwrap_or(TransportErrorKind::Other);
    TransportFailure { kind, message }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
