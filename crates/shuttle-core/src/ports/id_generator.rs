//! IdGenerator port - minting attempt tokens and sweep ids.
//!
//! # Implementations
//! - **UlidGenerator**: ULID based, timestamp taken from a [`Clock`]

use ulid::Ulid;

use crate::domain::ids::{AttemptToken, SweepId};
use crate::ports::Clock;

/// Mints identifiers that must be unique across every worker without coordination.
pub trait IdGenerator: Send + Sync {
    fn generate_attempt_token(&self) -> AttemptToken;

    fn generate_sweep_id(&self) -> SweepId;
}

/// ULID generator.
///
/// The timestamp half comes from the clock (so a `FixedClock` gives
/// reproducible prefixes); the 80 random bits keep tokens unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_attempt_token(&self) -> AttemptToken {
        AttemptToken::from(self.next_ulid())
    }

    fn generate_sweep_id(&self) -> SweepId {
        SweepId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_tokens() {
        let id_gen = UlidGenerator::new(SystemClock);

        let t1 = id_gen.generate_attempt_token();
        let t2 = id_gen.generate_attempt_token();
        let t3 = id_gen.generate_attempt_token();

        assert_ne!(t1, t2);
        assert_ne!(t2, t3);
        assert_ne!(t1, t3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let t1 = id_gen.generate_attempt_token();
        let t2 = id_gen.generate_attempt_token();

        // random half still differs
        assert_ne!(t1, t2);

        let timestamp1 = (t1.as_ulid().0 >> 80) as u64;
        let timestamp2 = (t2.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp1, timestamp2);
        assert_eq!(timestamp1, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_kinds_have_distinct_prefixes() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.generate_attempt_token().to_string().starts_with("attempt-"));
        assert!(id_gen.generate_sweep_id().to_string().starts_with("sweep-"));
    }
}
