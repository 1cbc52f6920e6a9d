use bytes::{Bytes, BytesMut};

/// One parsed SSE frame: optional event name plus joined data lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_named(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }
}

/// Encode one frame in wire form. `event` is omitted for data-only streams.
pub fn encode(event: Option<&str>, data: &str) -> Bytes {
    let mut out = BytesMut::new();
    if let Some(event) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(event.as_bytes());
        out.extend_from_slice(b"\n");
    }
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(data.as_bytes());
    out.extend_from_slice(b"\n\n");
    out.freeze()
}

/// Incremental SSE parser. Feed arbitrary byte chunks; complete frames come
/// out as they close. Bytes are buffered raw so multi-byte characters split
/// across chunks survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            self.consume_line(&line, &mut events);
        }
        events
    }

    /// Flush a trailing unterminated line and any half-built frame.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = decode_line(&rest);
            self.consume_line(&line, &mut events);
        }
        self.close_frame(&mut events);
        events
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        Some(decode_line(&line[..pos]))
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.close_frame(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn close_frame(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        });
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = match raw.last() {
        Some(b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}
