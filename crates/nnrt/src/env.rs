use std::env;

use once_cell::sync::Lazy;

static PASS_STATS: Lazy<bool> = Lazy::new(|| flag("NNRT_PASS_STATS"));
static SUBTENSOR_DISABLED: Lazy<bool> = Lazy::new(|| flag("NNRT_DISABLE_SUBTENSOR"));

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

/// Logs per-pass statistics at `info` level instead of `debug`.
pub(crate) fn pass_stats_enabled() -> bool {
    *PASS_STATS
}

/// Turns the concat-elimination analysis off globally.
pub(crate) fn subtensor_disabled() -> bool {
    *SUBTENSOR_DISABLED
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_truthy_values() {
        assert!(parse_bool("1"));
        assert!(parse_bool(" TRUE "));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
