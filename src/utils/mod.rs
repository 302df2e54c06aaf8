/// Utility functions and helpers
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(10000);

/// Connection id announced in the greeting, unique for the process lifetime
pub fn next_connection_id() -> u32 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Quote a value as a MySQL literal: an escaped string for UTF-8 text,
/// a hex literal for anything else so binary values reach the backend intact
pub fn quote_string(value: &[u8]) -> String {
    let text = match std::str::from_utf8(value) {
        Ok(text) => text,
        Err(_) => return format!("X'{}'", hex::encode_upper(value)),
    };
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        match c {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            '\0' => quoted.push_str("\\0"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\x1a' => quoted.push_str("\\Z"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_increase() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string(b"abc"), "'abc'");
        assert_eq!(quote_string(b"it's"), "'it\\'s'");
        assert_eq!(quote_string(b"a\\b\n"), "'a\\\\b\\n'");
        assert_eq!(quote_string("héllo".as_bytes()), "'héllo'");
    }

    #[test]
    fn test_quote_binary_as_hex() {
        assert_eq!(quote_string(&[0xff, 0x00, 0x27, 0x5c]), "X'FF00275C'");
        assert_eq!(quote_string(&[0xc3]), "X'C3'");
    }

    #[test]
    fn test_format_duration() {
        use std::time::Duration;

        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }
}
