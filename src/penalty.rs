//! Progressive penalty escalation shared by the quota limiter and the abuse
//! detector.
//!
//! The level is always derived from a violation or incident count; it is never
//! stored on its own.

use serde::{Deserialize, Serialize};

/// Window multipliers for escalation levels 1 through 5.
const MULTIPLIERS: [f64; 5] = [1.0, 0.5, 0.2, 0.1, 0.05];

/// Escalation level in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EscalationLevel(u8);

impl EscalationLevel {
    pub const MAX: u8 = 5;

    /// Level for a client with `prior` recorded offences.
    ///
    /// Zero and one offence share level 1; each further offence climbs one
    /// level until the table is exhausted.
    pub fn from_count(prior: usize) -> Self {
        Self(prior.clamp(1, Self::MAX as usize) as u8)
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    pub fn multiplier(&self) -> f64 {
        MULTIPLIERS[(self.0 - 1) as usize]
    }

    /// Shrink a request limit, never below one request.
    pub fn apply(&self, limit: u64) -> u64 {
        ((limit as f64 * self.multiplier()).floor() as u64).max(1)
    }
}

impl Default for EscalationLevel {
    fn default() -> Self {
        Self(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_clamp() {
        assert_eq!(EscalationLevel::from_count(0).level(), 1);
        assert_eq!(EscalationLevel::from_count(1).level(), 1);
        assert_eq!(EscalationLevel::from_count(3).level(), 3);
        assert_eq!(EscalationLevel::from_count(5).level(), 5);
        assert_eq!(EscalationLevel::from_count(500).level(), 5);
    }

    #[test]
    fn test_multiplier_table() {
        let multipliers: Vec<f64> = (1..=5)
            .map(|n| EscalationLevel::from_count(n).multiplier())
            .collect();
        assert_eq!(multipliers, vec![1.0, 0.5, 0.2, 0.1, 0.05]);
    }

    #[test]
    fn test_level_and_limit_are_monotonic() {
        let mut last_level = EscalationLevel::from_count(0);
        let mut last_limit = last_level.apply(50);
        for count in 1..20 {
            let level = EscalationLevel::from_count(count);
            let limit = level.apply(50);
            assert!(level >= last_level);
            assert!(limit <= last_limit);
            last_level = level;
            last_limit = limit;
        }
    }

    #[test]
    fn test_apply_floors_at_one() {
        assert_eq!(EscalationLevel::from_count(3).apply(20), 4);
        assert_eq!(EscalationLevel::from_count(5).apply(1), 1);
    }
}
