//! Flush Batching
//!
//! Accumulates a generation's output in memory and decides when the record
//! store should see it. A flush is due when enough characters are unflushed
//! or enough time has passed since the last flush, whichever comes first.

use std::time::{Duration, Instant};

/// When to write accumulated output to the record store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush once this many characters are unflushed
    pub max_pending_chars: usize,
    /// Flush once this long has passed since the last flush
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_pending_chars: 250,
            max_interval: Duration::from_millis(500),
        }
    }
}

/// In-memory output of one generation
#[derive(Debug)]
pub struct Accumulator {
    policy: FlushPolicy,
    content: String,
    reasoning: String,
    pending_chars: usize,
    last_flush: Instant,
    flushes: u32,
}

impl Accumulator {
    /// Empty accumulator; the flush clock starts now
    #[must_use]
    pub fn new(policy: FlushPolicy) -> Self {
        Self::starting_at(policy, Instant::now())
    }

    /// Empty accumulator with an explicit clock start
    #[must_use]
    pub fn starting_at(policy: FlushPolicy, now: Instant) -> Self {
        Self {
            policy,
            content: String::new(),
            reasoning: String::new(),
            pending_chars: 0,
            last_flush: now,
            flushes: 0,
        }
    }

    /// Append a content fragment
    pub fn push_content(&mut self, text: &str) {
        self.content.push_str(text);
        self.pending_chars += text.chars().count();
    }

    /// Append a reasoning fragment
    pub fn push_reasoning(&mut self, text: &str) {
        self.reasoning.push_str(text);
        self.pending_chars += text.chars().count();
    }

    /// Whether anything is unflushed
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.pending_chars > 0
    }

    /// Whether a flush is due at `now`
    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        self.is_dirty()
            && (self.pending_chars >= self.policy.max_pending_chars
                || now.saturating_duration_since(self.last_flush) >= self.policy.max_interval)
    }

    /// Record a successful flush at `now`
    pub fn mark_flushed(&mut self, now: Instant) {
        self.pending_chars = 0;
        self.last_flush = now;
        self.flushes += 1;
    }

    /// Content so far
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Reasoning so far, if any arrived
    #[must_use]
    pub fn reasoning(&self) -> Option<&str> {
        (!self.reasoning.is_empty()).then_some(self.reasoning.as_str())
    }

    /// Number of flushes recorded
    #[must_use]
    pub fn flushes(&self) -> u32 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FlushPolicy {
        FlushPolicy {
            max_pending_chars: 10,
            max_interval: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_size_trigger() {
        let start = Instant::now();
        let mut acc = Accumulator::starting_at(policy(), start);

        acc.push_content("12345");
        assert!(!acc.should_flush(start));
        acc.push_content("67890");
        assert!(acc.should_flush(start));

        acc.mark_flushed(start);
        assert!(!acc.is_dirty());
        assert_eq!(acc.content(), "1234567890");
        assert_eq!(acc.flushes(), 1);
    }

    #[test]
    fn test_time_trigger() {
        let start = Instant::now();
        let mut acc = Accumulator::starting_at(policy(), start);

        acc.push_content("a");
        assert!(!acc.should_flush(start + Duration::from_millis(499)));
        assert!(acc.should_flush(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_clean_accumulator_never_flushes() {
        let start = Instant::now();
        let acc = Accumulator::starting_at(policy(), start);
        assert!(!acc.should_flush(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_reasoning_counts_towards_size() {
        let start = Instant::now();
        let mut acc = Accumulator::starting_at(policy(), start);
        assert_eq!(acc.reasoning(), None);

        acc.push_reasoning("thinking hard");
        assert!(acc.should_flush(start));
        assert_eq!(acc.reasoning(), Some("thinking hard"));
        assert_eq!(acc.content(), "");
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let start = Instant::now();
        let mut acc = Accumulator::starting_at(policy(), start);
        acc.push_content("ñññññ");
        assert!(!acc.should_flush(start));
    }
}
