//! Stream entry-id arithmetic.
//!
//! Entry ids are `"<epoch_millis>-<seq>"`. Delayed entries are appended with
//! an explicit id whose millis component is the intended earliest-visible
//! time; everything here is shared between the producer (formatting), the
//! processor (fallback due check) and the scanner (plausibility filter).

/// Millis floor below which an id prefix cannot be a scheduling timestamp
/// (2020-01-01T00:00:00Z).
pub const PLAUSIBLE_EPOCH_MS: u64 = 1_577_836_800_000;

/// Parse an id into `(millis, seq)`. A bare `"<millis>"` reads as seq 0.
pub fn parse(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

/// The leading millis component, if the id is well-formed.
pub fn millis(id: &str) -> Option<u64> {
    parse(id).map(|(ms, _)| ms)
}

/// Render `(millis, seq)` back into the wire form.
pub fn format(ms: u64, seq: u64) -> String {
    format!("{ms}-{seq}")
}

/// Explicit id for an entry scheduled at `due_ms`.
pub fn delayed(due_ms: u64) -> String {
    format(due_ms, 0)
}

/// Whether the id's millis component plausibly encodes a wall-clock
/// timestamp rather than an ordinary small counter.
pub fn is_plausible_timestamp(id: &str) -> bool {
    millis(id).is_some_and(|ms| ms > PLAUSIBLE_EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_full_and_bare_ids() {
        assert_eq!(parse("1700000000000-3"), Some((1_700_000_000_000, 3)));
        assert_eq!(parse("1700000000000"), Some((1_700_000_000_000, 0)));
        assert_eq!(parse("not-an-id"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn delayed_id_is_seq_zero() {
        assert_eq!(delayed(1_700_000_000_000), "1700000000000-0");
    }

    #[test]
    fn plausibility_floor_rejects_small_ids() {
        assert!(is_plausible_timestamp("1700000000000-0"));
        assert!(!is_plausible_timestamp("42-0"));
        assert!(!is_plausible_timestamp("garbage"));
    }

    proptest! {
        #[test]
        fn format_parse_round_trip(ms in 0u64..=u64::MAX / 2, seq in 0u64..=u64::MAX / 2) {
            prop_assert_eq!(parse(&format(ms, seq)), Some((ms, seq)));
        }
    }
}
