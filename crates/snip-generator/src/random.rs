use crate::Generator;
use snip_core::ShortCode;
use typed_builder::TypedBuilder;

/// The 52 ASCII letters codes are drawn from.
pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub const DEFAULT_LENGTH: usize = 10;

/// Draws fixed-length codes uniformly from [`ALPHABET`].
///
/// Codes are not guaranteed to be unique; backends reject or retry
/// collisions against what they already store.
#[derive(Debug, Clone, TypedBuilder)]
pub struct AlphabeticGenerator {
    #[builder(default = DEFAULT_LENGTH)]
    length: usize,
}

impl AlphabeticGenerator {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for AlphabeticGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator for AlphabeticGenerator {
    type Output = ShortCode;

    fn generate(&self) -> Self::Output {
        let code: String = std::iter::repeat_with(|| {
            ALPHABET[rand::random_range(0..ALPHABET.len())] as char
        })
        .take(self.length)
        .collect();
        ShortCode::new_unchecked(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_codes_are_ten_letters() {
        let generator = AlphabeticGenerator::new();

        for _ in 0..100 {
            let code = generator.generate();
            assert_eq!(code.as_str().len(), 10);
            assert!(code.as_str().chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn generated_codes_pass_validation() {
        let generator = AlphabeticGenerator::new();
        let code = generator.generate();
        assert!(ShortCode::new(code.as_str()).is_ok());
    }

    #[test]
    fn custom_length() {
        let generator = AlphabeticGenerator::builder().length(4).build();
        assert_eq!(generator.generate().as_str().len(), 4);
    }

    #[test]
    fn alphabet_has_52_distinct_letters() {
        let distinct: HashSet<u8> = ALPHABET.iter().copied().collect();
        assert_eq!(distinct.len(), 52);
    }

    #[test]
    fn codes_vary() {
        let generator = AlphabeticGenerator::new();
        let codes: HashSet<String> = (0..50)
            .map(|_| generator.generate().into_inner())
            .collect();
        assert!(codes.len() > 45);
    }
}
