use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Ordered normalization rules: each substitutes one family of variable
/// tokens with a fixed placeholder. Order matters — UUIDs and request ids
/// contain digit runs that must not be shredded by the integer rule, and
/// bare integers are word-bounded so hex addresses survive to their own
/// rule.
static NORMALIZATION_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(
                r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            )
            .expect("uuid rule"),
            "<UUID>",
        ),
        (
            Regex::new(r"(?i)\b(?:req|request)[-_][A-Za-z0-9]+\b").expect("request id rule"),
            "<REQUEST_ID>",
        ),
        (Regex::new(r"\b\d+\b").expect("integer rule"), "<NUM>"),
        (
            Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("hex address rule"),
            "<ADDR>",
        ),
    ]
});

/// Collapses variable data (ids, numbers, addresses) in an error message to
/// placeholders so structurally identical errors share one shape.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.to_string();
    for (pattern, placeholder) in NORMALIZATION_RULES.iter() {
        normalized = pattern.replace_all(&normalized, *placeholder).into_owned();
    }
    normalized
}

/// Stable 8-hex-char identifier for an error shape: the normalized message
/// combined with its type and endpoint, hashed and truncated.
pub fn fingerprint(error_type: &str, endpoint: &str, message: &str) -> String {
    let normalized = normalize_message(message);
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_collapse_to_placeholder() {
        let normalized =
            normalize_message("session 550e8400-e29b-41d4-a716-446655440000 expired");
        assert_eq!(normalized, "session <UUID> expired");
    }

    #[test]
    fn request_ids_collapse_before_integers() {
        let normalized = normalize_message("lookup failed for req-a81b22: gone");
        assert_eq!(normalized, "lookup failed for <REQUEST_ID>: gone");
    }

    #[test]
    fn bare_integers_collapse_but_hex_addresses_survive_to_their_rule() {
        let normalized = normalize_message("read 4096 bytes at 0x7f8a9b3c");
        assert_eq!(normalized, "read <NUM> bytes at <ADDR>");
    }

    #[test]
    fn identical_shapes_share_a_fingerprint() {
        let a = fingerprint("timeout", "/v1/chat", "upstream timed out after 3000 ms");
        let b = fingerprint("timeout", "/v1/chat", "upstream timed out after 9000 ms");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn type_or_endpoint_changes_the_fingerprint() {
        let base = fingerprint("timeout", "/v1/chat", "upstream timed out");
        assert_ne!(base, fingerprint("overload", "/v1/chat", "upstream timed out"));
        assert_ne!(base, fingerprint("timeout", "/v1/embed", "upstream timed out"));
    }
}
