use bytes::Bytes;

/// One decoded SSE frame: optional event name plus the joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Bytes may arrive split anywhere, including inside
/// a line or a JSON value; pending input is carried between pushes and frames
/// are emitted only once their blank-line terminator arrives.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: String,
    pending: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        // Carry partial UTF-8 sequences over to the next chunk; sequences
        // that are invalid outright are replaced rather than held forever.
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    let text = text.to_owned();
                    self.pending.clear();
                    frames.extend(self.push_str(&text));
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    let text =
                        String::from_utf8_lossy(&self.pending[..valid_len]).into_owned();
                    frames.extend(self.push_str(&text));
                    match err.error_len() {
                        // A split sequence: keep the tail for the next push.
                        None => {
                            self.pending.drain(..valid_len);
                            break;
                        }
                        Some(skip) => {
                            frames.extend(self.push_str("\u{FFFD}"));
                            self.pending.drain(..valid_len + skip);
                        }
                    }
                }
            }
        }
        frames
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_frame(&mut frames);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = (!value.is_empty()).then(|| value.to_string());
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
            }
        }

        frames
    }

    /// Flush whatever remains once the stream ends.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = (!value.is_empty()).then(|| value.to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.finish_frame(&mut frames);
        frames
    }

    fn finish_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_on_blank_line() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_str("data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[1].is_done_marker());
    }

    #[test]
    fn chunk_boundary_inside_json() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push_str("data: {\"content\":\"Hel").is_empty());
        let frames = parser.push_str("lo\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"content\":\"Hello\"}");
    }

    #[test]
    fn chunk_boundary_inside_utf8_sequence() {
        let mut parser = SseFrameParser::new();
        let bytes = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(parser.push_bytes(&Bytes::copy_from_slice(&bytes[..split])).is_empty());
        let frames = parser.push_bytes(&Bytes::copy_from_slice(&bytes[split..]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"t\":\"héllo\"}");
    }

    #[test]
    fn named_events_and_comments() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_str(
            ": keep-alive\nevent: response.output_text.delta\ndata: {\"delta\":\"x\"}\n\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("response.output_text.delta"));
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let frames = parser.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "tail");
    }
}
