use crate::Generator;
use snip_core::ShortCode;
use std::sync::atomic::{AtomicU64, Ordering};

/// A deterministic generator producing sequential codes like "wh000000", "wh000001".
///
/// Used in tests and fixtures where codes must be predictable. Each
/// instance counts independently.
#[derive(Debug)]
pub struct SeqGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl SeqGenerator {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::with_offset(prefix, 0)
    }

    /// Creates a generator whose first code uses `offset` as its counter value.
    pub fn with_offset(prefix: impl Into<String>, offset: u64) -> Self {
        Self {
            counter: AtomicU64::new(offset),
            prefix: prefix.into(),
        }
    }
}

impl Generator for SeqGenerator {
    type Output = ShortCode;

    fn generate(&self) -> ShortCode {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        ShortCode::new_unchecked(format!("{}{:06}", self.prefix, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_sequential_codes() {
        let generator = SeqGenerator::with_prefix("wh");

        assert_eq!(generator.generate().as_str(), "wh000000");
        assert_eq!(generator.generate().as_str(), "wh000001");
        assert_eq!(generator.generate().as_str(), "wh000002");
    }

    #[test]
    fn starts_at_offset() {
        let generator = SeqGenerator::with_offset("wh", 1000);

        assert_eq!(generator.generate().as_str(), "wh001000");
        assert_eq!(generator.generate().as_str(), "wh001001");
    }

    #[test]
    fn generator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SeqGenerator>();
    }
}
