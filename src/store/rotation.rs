//! When to retire the active log file.

use std::time::Duration;

use crate::config::StoreConfig;

/// Which threshold caused a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    Elapsed,
    Size,
    Lines,
}

impl std::fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationTrigger::Elapsed => write!(f, "elapsed"),
            RotationTrigger::Size => write!(f, "size"),
            RotationTrigger::Lines => write!(f, "lines"),
        }
    }
}

/// Rotation thresholds. Any single threshold being reached is enough.
///
/// There is no minimum interval between rotations: a zero `rotate_every`
/// fires on every evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub rotate_every: Duration,
    pub max_size_bytes: u64,
    pub rotate_after_lines: Option<u64>,
}

impl RotationPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            rotate_every: config.rotate_every,
            max_size_bytes: config.max_size_bytes,
            rotate_after_lines: config.rotate_after_lines,
        }
    }

    /// Decide whether a file open for `elapsed`, `size_bytes` large and
    /// holding `line_count` data rows should be rotated.
    pub fn evaluate(
        &self,
        elapsed: Duration,
        size_bytes: u64,
        line_count: u64,
    ) -> Option<RotationTrigger> {
        if elapsed >= self.rotate_every {
            Some(RotationTrigger::Elapsed)
        } else if size_bytes >= self.max_size_bytes {
            Some(RotationTrigger::Size)
        } else if self
            .rotate_after_lines
            .is_some_and(|limit| line_count >= limit)
        {
            Some(RotationTrigger::Lines)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn policy(hours: u64, max_size_bytes: u64, lines: Option<u64>) -> RotationPolicy {
        RotationPolicy {
            rotate_every: HOUR * hours as u32,
            max_size_bytes,
            rotate_after_lines: lines,
        }
    }

    #[test]
    fn test_nothing_reached() {
        let policy = policy(24, 1024, Some(100));
        assert_eq!(policy.evaluate(HOUR, 512, 10), None);
    }

    #[test]
    fn test_size_alone_triggers() {
        let policy = policy(1000, 64, None);
        assert_eq!(
            policy.evaluate(Duration::ZERO, 64, 1),
            Some(RotationTrigger::Size)
        );
    }

    #[test]
    fn test_elapsed_alone_triggers() {
        let policy = policy(1, u64::MAX, None);
        assert_eq!(
            policy.evaluate(HOUR, 10, 1),
            Some(RotationTrigger::Elapsed)
        );
        assert_eq!(policy.evaluate(HOUR - Duration::from_secs(1), 10, 1), None);
    }

    #[test]
    fn test_lines_only_when_configured() {
        let with_limit = policy(1000, u64::MAX, Some(3));
        assert_eq!(
            with_limit.evaluate(Duration::ZERO, 10, 3),
            Some(RotationTrigger::Lines)
        );

        let without_limit = policy(1000, u64::MAX, None);
        assert_eq!(without_limit.evaluate(Duration::ZERO, 10, u64::MAX), None);
    }

    #[test]
    fn test_zero_interval_always_rotates() {
        let policy = policy(0, u64::MAX, None);
        assert_eq!(
            policy.evaluate(Duration::ZERO, 0, 0),
            Some(RotationTrigger::Elapsed)
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = StoreConfig::new("/tmp/logs");
        config.rotate_after_lines = Some(50);
        let policy = RotationPolicy::from_config(&config);

        assert_eq!(policy.rotate_every, config.rotate_every);
        assert_eq!(policy.max_size_bytes, config.max_size_bytes);
        assert_eq!(policy.rotate_after_lines, Some(50));
    }
}
