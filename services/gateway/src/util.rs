// Small shared helpers.

/// Current wall-clock time as unix milliseconds.
pub fn unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Current wall-clock time as unix seconds.
pub fn unix_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Truncate to at most `max` characters on a char boundary, appending an
/// ellipsis when anything was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
    }

    #[test]
    fn truncate_cuts_long_strings_with_ellipsis() {
        let t = truncate_chars("hello world", 6);
        assert_eq!(t, "hello…");
        assert_eq!(t.chars().count(), 6);
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let t = truncate_chars("ééééé", 3);
        assert_eq!(t.chars().count(), 3);
    }
}
