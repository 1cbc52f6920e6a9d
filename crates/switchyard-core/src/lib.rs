pub mod broadcast;
pub mod client;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;

mod stream_pump;

pub use broadcast::{Broadcaster, StreamOutcome, Subscriber};
pub use client::{
    HttpClientPool, TransportFailure, UpstreamBody, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
pub use dedup::{BeginRole, DedupRegistry, SharedOutcome, SharedResponse};
pub use error::ProxyError;
pub use orchestrator::{MessagesReply, Orchestrator};
