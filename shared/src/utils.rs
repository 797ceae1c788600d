//! Shared utilities
//!
use tracing_subscriber::EnvFilter;

pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        // Setup from the environment (RUST_LOG)
        .with_env_filter(EnvFilter::from_default_env())
        // this needs to be set to false, otherwise ANSI color codes will
        // show up in a confusing manner in the platform log stream.
        .with_ansi(false)
        // disabling time is handy because the log stream adds the ingestion time.
        .without_time()
        .init();
}

/// Shortens `s` to at most `max_chars` characters for log lines, marking the cut.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...(truncated)", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_keeps_short_strings() {
        assert_eq!(truncate_for_log("abc", 10), "abc");
    }

    #[test]
    fn truncate_for_log_cuts_on_char_boundaries() {
        assert_eq!(truncate_for_log("héllo wörld", 4), "héll...(truncated)");
    }
}
