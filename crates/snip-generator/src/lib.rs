pub mod random;
pub mod seq;

pub use random::AlphabeticGenerator;
pub use seq::SeqGenerator;

use snip_core::ShortCode;
use std::sync::Arc;

/// Trait for generating short codes.
///
/// Implementations are pure generators that don't interact with storage.
/// Uniqueness is enforced by the backend that stores the code.
pub trait Generator: Send + Sync + 'static {
    type Output: Into<ShortCode>;

    /// Generates a candidate short code.
    fn generate(&self) -> Self::Output;
}

impl<G: Generator> Generator for Arc<G> {
    type Output = G::Output;

    fn generate(&self) -> Self::Output {
        G::generate(self)
    }
}
