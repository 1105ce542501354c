//! Timestamp-prefixed opaque identifiers.
//!
//! Ids sort chronologically as plain strings, which the chat store relies
//! on when inferring `last_message_at` from message ids.

use chrono::Utc;
use uuid::Uuid;

/// Generate an id of the form `{prefix}_{YYYYmmdd_HHMMSS}_{8 hex chars}`.
pub fn prefixed_id(prefix: &str) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{ts}_{}", &suffix[..8])
}

/// Short random id (8 hex chars) for registrations and scheduled tasks.
pub fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_carry_prefix_and_are_unique() {
        let a = prefixed_id("atom");
        let b = prefixed_id("atom");
        assert!(a.starts_with("atom_"));
        assert_ne!(a, b);
    }

    #[test]
    fn short_ids_are_eight_chars() {
        assert_eq!(short_id().len(), 8);
    }
}
