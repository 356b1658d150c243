//! Incremental Server-Sent Events parsing.
//!
//! Vendors frame their streaming responses as SSE: `event:`/`data:` lines,
//! frames separated by a blank line. The parser is fed raw body chunks as
//! they arrive and yields complete frames; partial frames stay buffered.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if the frame carried one.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Stateful frame assembler over a chunked byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some((end, sep_len)) = frame_boundary(&self.buffer) {
            let frame: String = self.buffer.drain(..end + sep_len).collect();
            if let Some(event) = parse_frame(&frame[..end]) {
                events.push(event);
            }
        }
        events
    }

    /// True when a partial frame is still buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Byte offset and length of the earliest blank-line separator, LF or CRLF.
fn frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (lf, crlf) => lf.or(crlf),
    }
}

fn parse_frame(text: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            // the field value gets exactly one leading space stripped
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match &mut data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            // id and retry are irrelevant to these APIs
            _ => {}
        }
    }

    data.map(|data| SseEvent { event, data })
}
