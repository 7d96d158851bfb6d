//! Spec identity comparison
//!
//! Two specs are the same environment when the builder hashes them equally,
//! or, without a working hash, when their normalized forms agree.

pub mod cache;
pub mod comparator;
pub mod normalize;

pub use cache::BoundedCache;
pub use comparator::{IdentityComparator, DEFAULT_CACHE_CAPACITY};
pub use normalize::NormalizedSpec;
