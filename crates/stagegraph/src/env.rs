use std::env;
use std::sync::OnceLock;

static STAGEGRAPH_PASS_STATS: OnceLock<bool> = OnceLock::new();
static STAGEGRAPH_NEGOTIATION_MAX_ITERS: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_positive(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

pub(crate) fn pass_stats_enabled() -> bool {
    *STAGEGRAPH_PASS_STATS.get_or_init(|| match env::var("STAGEGRAPH_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn negotiation_max_iters() -> Option<usize> {
    *STAGEGRAPH_NEGOTIATION_MAX_ITERS.get_or_init(|| {
        env::var("STAGEGRAPH_NEGOTIATION_MAX_ITERS")
            .ok()
            .and_then(|value| parse_positive(&value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_flags() {
        assert!(parse_bool("1"));
        assert!(parse_bool(" On "));
        assert!(!parse_bool("off"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn rejects_zero_iteration_cap() {
        assert_eq!(parse_positive("12"), Some(12));
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("many"), None);
    }
}
