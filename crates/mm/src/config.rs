//! Allocator configuration.

use core::str::FromStr;

/// Strategy used to pick a free block for an allocation request.
///
/// Both strategies search the segregated lists from the class of the request
/// upward. They differ only in how a class is scanned.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    derive_more::IsVariant,
)]
pub enum FitPolicy {
    /// Take the first block that is large enough.
    ///
    /// Searches stay short, at the price of somewhat more fragmentation.
    #[default]
    #[display("first-fit")]
    FirstFit,
    /// Take the smallest block that is large enough.
    ///
    /// Scans a whole class, stopping early on an exact match.
    #[display("best-fit")]
    BestFit,
}

/// The error returned when parsing an unknown [`FitPolicy`] name.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("unknown fit policy: expected `first-fit` or `best-fit`")]
pub struct ParseFitPolicyError;

impl FromStr for FitPolicy {
    type Err = ParseFitPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-fit" | "first" => Ok(Self::FirstFit),
            "best-fit" | "best" => Ok(Self::BestFit),
            _ => Err(ParseFitPolicyError),
        }
    }
}

/// Tunable parameters of an [`Allocator`](crate::Allocator).
///
/// # Examples
///
/// ```
/// use mm::{Config, FitPolicy};
///
/// let config = Config::new()
///     .with_chunk_size(1 << 16)
///     .with_fit(FitPolicy::BestFit);
/// assert_eq!(config.chunk_size, 65536);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// Minimum number of bytes requested from the region when the heap has
    /// to grow. Rounded up to the allocator alignment.
    pub chunk_size: usize,
    /// Strategy used to pick a free block.
    pub fit: FitPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Default value of [`chunk_size`](Self::chunk_size): one page.
    pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            fit: FitPolicy::FirstFit,
        }
    }

    #[must_use]
    pub const fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }

    #[must_use]
    pub const fn with_fit(self, fit: FitPolicy) -> Self {
        Self { fit, ..self }
    }
}
