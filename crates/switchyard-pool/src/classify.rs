use crate::config::ConfigSnapshot;

/// Transport-level failure kinds, mirrored from the upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Reset,
    Other,
}

/// Keyword table for classifying transport errors from their display text,
/// checked in order; the first hit wins. Connection-phase keywords come
/// before the generic timeout ones so "error trying to connect: ... timed
/// out" lands on the connect side.
const TRANSPORT_KEYWORDS: &[(&str, TransportErrorKind)] = &[
    ("dns", TransportErrorKind::Dns),
    ("resolve", TransportErrorKind::Dns),
    ("certificate", TransportErrorKind::Tls),
    ("handshake", TransportErrorKind::Tls),
    ("tls", TransportErrorKind::Tls),
    ("ssl", TransportErrorKind::Tls),
    ("reset", TransportErrorKind::Reset),
    ("broken pipe", TransportErrorKind::Reset),
    ("refused", TransportErrorKind::Connect),
    ("connect", TransportErrorKind::Connect),
    ("timed out", TransportErrorKind::Timeout),
    ("timeout", TransportErrorKind::Timeout),
];

impl TransportErrorKind {
    /// Whether this kind counts toward the unhealthy threshold.
    pub fn is_qualifying(&self) -> bool {
        !matches!(self, TransportErrorKind::Other)
    }

    /// Best-effort classification of an HTTP client error from its display
    /// text. The taxonomy lives here so every caller judges transport
    /// failures the same way.
    pub fn parse(detail: &str) -> Option<Self> {
        let detail = detail.to_ascii_lowercase();
        TRANSPORT_KEYWORDS
            .iter()
            .find(|(keyword, _)| detail.contains(*keyword))
            .map(|(_, kind)| *kind)
    }
}

/// Why a completed exchange was judged unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    HttpStatus(u16),
    Transport(TransportErrorKind),
    BodyPattern(String),
    SseError(String),
    /// A 2xx response whose body could not be decoded as the expected wire
    /// format.
    MalformedResponse,
}

impl FailureKind {
    pub fn is_qualifying(&self) -> bool {
        match self {
            FailureKind::Transport(kind) => kind.is_qualifying(),
            FailureKind::HttpStatus(_)
            | FailureKind::BodyPattern(_)
            | FailureKind::SseError(_)
            | FailureKind::MalformedResponse => true,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::HttpStatus(status) => write!(f, "http {status}"),
            FailureKind::Transport(kind) => write!(f, "transport {kind:?}"),
            FailureKind::BodyPattern(pattern) => write!(f, "body pattern {pattern:?}"),
            FailureKind::SseError(detail) => write!(f, "sse error {detail}"),
            FailureKind::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

/// Judge a completed upstream response: unhealthy HTTP status first, then
/// configured substrings and regexes over the decoded body preview.
pub fn evaluate_response(
    status: u16,
    body_preview: &str,
    snapshot: &ConfigSnapshot,
) -> Option<FailureKind> {
    if snapshot.settings.unhealthy_http_codes.contains(&status) {
        return Some(FailureKind::HttpStatus(status));
    }
    for needle in &snapshot.settings.unhealthy_error_types {
        if !needle.is_empty() && body_preview.contains(needle.as_str()) {
            return Some(FailureKind::BodyPattern(needle.clone()));
        }
    }
    for regex in snapshot.body_patterns() {
        if regex.is_match(body_preview) {
            return Some(FailureKind::BodyPattern(regex.as_str().to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;

    fn snapshot(extra_settings: &str) -> ConfigSnapshot {
        let text = format!(
            r#"
providers:
  - name: a
    type: anthropic
    base_url: http://localhost
    auth_type: api_key
    auth_value: k
settings:
{extra_settings}
"#
        );
        ConfigSnapshot::parse_str(&text).unwrap()
    }

    #[test]
    fn unhealthy_status_qualifies() {
        let snapshot = snapshot("  {}");
        assert_eq!(
            evaluate_response(500, "", &snapshot),
            Some(FailureKind::HttpStatus(500))
        );
        assert_eq!(evaluate_response(200, "", &snapshot), None);
        // Auth failures are not in the default list; retrying will not help.
        assert_eq!(evaluate_response(401, "", &snapshot), None);
    }

    #[test]
    fn body_substring_and_regex_qualify() {
        let snapshot = snapshot(
            "  unhealthy_response_body_patterns:\n    - \"quota.*exceeded\"\n",
        );
        assert!(matches!(
            evaluate_response(200, "upstream overloaded, retry later", &snapshot),
            Some(FailureKind::BodyPattern(_))
        ));
        assert!(matches!(
            evaluate_response(200, "monthly quota has been exceeded", &snapshot),
            Some(FailureKind::BodyPattern(_))
        ));
        assert_eq!(evaluate_response(200, "all good", &snapshot), None);
    }

    #[test]
    fn transport_kinds_qualify_except_other() {
        assert!(TransportErrorKind::Connect.is_qualifying());
        assert!(TransportErrorKind::Dns.is_qualifying());
        assert!(TransportErrorKind::Tls.is_qualifying());
        assert!(TransportErrorKind::ReadTimeout.is_qualifying());
        assert!(TransportErrorKind::Reset.is_qualifying());
        assert!(!TransportErrorKind::Other.is_qualifying());
    }

    #[test]
    fn transport_parse_maps_common_error_texts() {
        assert_eq!(
            TransportErrorKind::parse("dns error: failed to lookup address"),
            Some(TransportErrorKind::Dns)
        );
        assert_eq!(
            TransportErrorKind::parse("invalid peer certificate contents"),
            Some(TransportErrorKind::Tls)
        );
        assert_eq!(
            TransportErrorKind::parse("Connection reset by peer"),
            Some(TransportErrorKind::Reset)
        );
        assert_eq!(
            TransportErrorKind::parse("error trying to connect: operation timed out"),
            Some(TransportErrorKind::Connect)
        );
        assert_eq!(
            TransportErrorKind::parse("request timed out"),
            Some(TransportErrorKind::Timeout)
        );
        assert_eq!(TransportErrorKind::parse("body decode stalled"), None);
    }
}
