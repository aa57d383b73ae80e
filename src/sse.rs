//! Wire framing for streamed events.
//!
//! Terminals hold a long-lived event stream per workcenter. Every event is
//! UTF-8 text in the standard server-push framing: `data: <JSON>\n\n`. The
//! header constants are for the transport layer serving the stream — the
//! connection stays open until either side closes it, and intermediaries
//! must not cache or buffer it.

use serde::Serialize;

pub const CONTENT_TYPE: &str = "text/event-stream";
pub const CACHE_CONTROL: &str = "no-cache";
pub const CONNECTION: &str = "keep-alive";

/// Frame a payload for the event stream.
pub fn frame<T: Serialize>(payload: &T) -> String {
    // Serialization of our own event types cannot fail; fall back to an
    // empty object rather than poisoning the stream.
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_is_data_prefixed_with_blank_line_terminator() {
        let framed = frame(&json!({"x": 1}));
        assert_eq!(framed, "data: {\"x\":1}\n\n");
    }

    #[test]
    fn frame_is_utf8_text() {
        let framed = frame(&json!({"note": "Ø12.7 ±0.05"}));
        assert!(framed.starts_with("data: "));
        assert!(framed.ends_with("\n\n"));
    }
}
