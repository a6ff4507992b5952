use serde_json::Value;

/// Incremental SSE parser for an upstream byte stream. Network reads split
/// events at arbitrary byte offsets, including inside a multi-byte UTF-8
/// sequence, so both a byte remainder and a text remainder are carried
/// between feeds. One framer per upstream connection; not restartable.
#[derive(Debug, Default)]
pub struct ChunkFramer {
    /// Trailing bytes of an incomplete UTF-8 sequence from the last feed.
    byte_tail: Vec<u8>,
    /// Decoded text that has not yet formed a complete event.
    text_buf: String,
}

impl ChunkFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw network read, returning every JSON event completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.decode(bytes);

        let mut events = Vec::new();
        while let Some(boundary) = self.text_buf.find("\n\n") {
            let event: String = self.text_buf.drain(..boundary + 2).collect();
            if let Some(value) = parse_event(&event) {
                events.push(value);
            }
        }
        events
    }

    /// Flushes at end of stream: a final event is valid without a trailing
    /// blank line.
    pub fn finish(&mut self) -> Option<Value> {
        if !self.byte_tail.is_empty() {
            let tail = std::mem::take(&mut self.byte_tail);
            self.text_buf.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.text_buf);
        parse_event(&rest)
    }

    fn decode(&mut self, bytes: &[u8]) {
        self.byte_tail.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.byte_tail) {
                Ok(text) => {
                    self.text_buf.push_str(text);
                    self.byte_tail.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // Everything before valid_up_to decodes; the tail is
                    // either an incomplete sequence to carry over or garbage
                    // to drop before decoding the rest of this feed.
                    let text =
                        std::str::from_utf8(&self.byte_tail[..valid]).expect("validated prefix");
                    self.text_buf.push_str(text);
                    match err.error_len() {
                        Some(len) => {
                            tracing::debug!("invalid utf-8 in upstream stream, dropping bytes");
                            self.byte_tail.drain(..valid + len);
                        }
                        None => {
                            self.byte_tail.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn parse_event(event: &str) -> Option<Value> {
    let mut payload = String::new();
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        payload.push_str(data.strip_prefix(' ').unwrap_or(data));
    }
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str(&payload) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(%error, "dropping unparseable stream event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_complete_events() {
        let mut framer = ChunkFramer::new();
        let events = framer.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn carries_partial_event_across_feeds() {
        let mut framer = ChunkFramer::new();
        assert!(framer.feed(b"data: {\"text\":").is_empty());
        let events = framer.feed(b"\"hi\"}\n\n");
        assert_eq!(events, vec![json!({"text": "hi"})]);
    }

    #[test]
    fn survives_mid_multibyte_split() {
        let payload = "data: {\"text\":\"日本語\"}\n\n".as_bytes();
        // Split inside the second byte of 本.
        let cut = payload.iter().position(|b| *b == 0xe6).unwrap() + 4;
        let mut framer = ChunkFramer::new();
        assert!(framer.feed(&payload[..cut]).is_empty());
        let events = framer.feed(&payload[cut..]);
        assert_eq!(events, vec![json!({"text": "日本語"})]);
    }

    #[test]
    fn ignores_done_sentinel_and_non_data_lines() {
        let mut framer = ChunkFramer::new();
        let events = framer.feed(b"event: ping\ndata: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec![json!({"x": 1})]);
    }

    #[test]
    fn drops_malformed_json() {
        let mut framer = ChunkFramer::new();
        let events = framer.feed(b"data: {broken\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(events, vec![json!({"ok": true})]);
    }

    #[test]
    fn event_after_invalid_byte_arrives_in_same_feed() {
        let mut framer = ChunkFramer::new();
        let mut bytes = vec![0xff];
        bytes.extend_from_slice(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        let events = framer.feed(&bytes);
        assert_eq!(events, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut framer = ChunkFramer::new();
        assert!(framer.feed(b"data: {\"last\":true}").is_empty());
        assert_eq!(framer.finish(), Some(json!({"last": true})));
        assert_eq!(framer.finish(), None);
    }
}
