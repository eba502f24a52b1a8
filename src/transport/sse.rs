//! Server-Sent-Events framing
//!
//! Shared by the event-stream and streamable transports: both receive SSE
//! bodies whose chunk boundaries are arbitrary, so the framer accumulates
//! bytes until a blank line terminates an event block. Within a block,
//! `data:` lines are newline-joined into the event payload, `event:` sets
//! the event type, and `id:` sets the SSE event id (used for `Last-Event-ID`
//! resumption, never for correlation -- correlation uses the JSON payload's
//! own `id` member).

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if present.
    pub event: Option<String>,
    /// Newline-joined `data:` payload, if any `data:` lines were present.
    pub data: Option<String>,
    /// Value of the `id:` field, if present.
    pub id: Option<String>,
}

/// Incremental SSE decoder.
///
/// Feed raw chunks with [`SseEventBuffer::push`]; complete events are
/// returned as soon as their terminating blank line has been seen,
/// regardless of how the byte stream was fragmented.
///
/// # Examples
///
/// ```
/// use mcplink::transport::sse::SseEventBuffer;
///
/// let mut buffer = SseEventBuffer::default();
/// assert!(buffer.push(b"data: {\"jsonrpc\"").is_empty());
/// let events = buffer.push(b":\"2.0\"}\n\n");
/// assert_eq!(events[0].data.as_deref(), Some(r#"{"jsonrpc":"2.0"}"#));
/// ```
#[derive(Debug, Default)]
pub struct SseEventBuffer {
    buffer: String,
}

impl SseEventBuffer {
    /// Append a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Decode a trailing partial block at end of stream, if any.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

/// Decode one event block (the text between two blank-line delimiters).
///
/// Returns `None` for blocks with no recognized fields (e.g. pure `:`
/// comment blocks or stray whitespace).
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<String> = None;
    let mut event_id: Option<String> = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim().to_string());
        }
        // `retry:` fields, `:` comments, and unknown fields are ignored.
    }

    if data_lines.is_empty() && event_type.is_none() && event_id.is_none() {
        return None;
    }

    let data = if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    };

    Some(SseEvent {
        event: event_type,
        data,
        id: event_id,
    })
}
