//! Identifier generation (Design Notes §9 of the spec).
//!
//! Two schemes coexist on purpose: an 8-digit random integer with bounded
//! retry for client-facing ids that must stay short and typeable, and a
//! UUID v7 generator for internal string ids (`conn_…`, `tun_…`) where
//! there is no external requirement for a small numeric space and a retry
//! loop would be pure waste as the population grows.

use rand::Rng;
use uuid::Uuid;

/// Draws a uniform random value in `[min, max)`, retrying on collision (as
/// reported by `is_taken`) up to `max_retries` times. This is the "known
/// quadratic failure mode" generator the spec calls out — treat it as a
/// plug point, not a guarantee, for id spaces that must stay small.
pub fn random_id_with_retry<F>(min: i64, max_exclusive: i64, max_retries: u32, mut is_taken: F) -> Option<i64>
where
    F: FnMut(i64) -> bool,
{
    let mut rng = rand::thread_rng();
    for _ in 0..max_retries {
        let candidate = rng.gen_range(min..max_exclusive);
        if !is_taken(candidate) {
            return Some(candidate);
        }
    }
    None
}

/// A fresh UUID v7 (time-ordered, no collision bookkeeping needed) string
/// id with the given prefix, e.g. `new_prefixed_id("conn")` → `conn_0189...`.
pub fn new_prefixed_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn retry_generator_avoids_taken_ids() {
        let taken: HashSet<i64> = (0..10).collect();
        let id = random_id_with_retry(0, 10_000, 100, |candidate| taken.contains(&candidate)).unwrap();
        assert!(!taken.contains(&id));
    }

    #[test]
    fn retry_generator_gives_up_when_space_exhausted() {
        let id = random_id_with_retry(0, 1, 100, |_| true);
        assert!(id.is_none());
    }

    #[test]
    fn prefixed_ids_are_unique_and_prefixed() {
        let a = new_prefixed_id("conn");
        let b = new_prefixed_id("conn");
        assert_ne!(a, b);
        assert!(a.starts_with("conn_"));
    }
}
