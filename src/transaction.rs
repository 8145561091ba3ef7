//! Transaction identifiers.
//!
//! A transaction is an opaque correlation id supplied by the caller (CLI flag
//! or trailing bus argument) or synthesized on entry. It flows by value down
//! the call tree and is attached to every event and response envelope; it is
//! never stored.

use chrono::Utc;

/// Resolve the effective transaction id for a request.
///
/// An explicit, non-empty caller id wins; otherwise a fresh one is
/// synthesized from the current timestamp plus a random suffix.
pub fn resolve(explicit: Option<&str>) -> String {
    match explicit {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => synthesize(),
    }
}

/// Synthesize a transaction id: unix milliseconds plus a random hex suffix.
fn synthesize() -> String {
    format!("{}-{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_is_kept() {
        assert_eq!(resolve(Some("tx-1")), "tx-1");
        assert_eq!(resolve(Some("  tx-2  ")), "tx-2");
    }

    #[test]
    fn blank_id_is_replaced() {
        let id = resolve(Some("   "));
        assert!(id.contains('-'));
    }

    #[test]
    fn synthesized_ids_are_distinct() {
        let a = resolve(None);
        let b = resolve(None);
        assert_ne!(a, b);
    }
}
