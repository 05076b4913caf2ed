use chrono::{Local, SecondsFormat};

/// Turns a consumed payload into the text pushed to subscribers.
pub trait Transform: Send + Sync {
    fn apply(&self, raw: &[u8]) -> String;
}

/// Default transform: `Processed: <data> at <timestamp>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessedStamp;

pub const PROCESSED_MARKER: &str = "Processed:";

impl Transform for ProcessedStamp {
    fn apply(&self, raw: &[u8]) -> String {
        let data = String::from_utf8_lossy(raw);
        let at = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        format!("{PROCESSED_MARKER} {data} at {at}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_carries_marker_and_input() {
        let out = ProcessedStamp.apply(b"hello world");
        assert!(out.starts_with("Processed: hello world at "));
        let stamp = out.rsplit(" at ").next().expect("timestamp");
        chrono::DateTime::parse_from_rfc3339(stamp).expect("rfc3339 timestamp");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let out = ProcessedStamp.apply(&[0x68, 0x69, 0xff]);
        assert!(out.contains("hi\u{fffd}"));
    }
}
