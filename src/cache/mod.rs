//! Build cache
//!
//! A cache entry is not stored anywhere on its own. Every image a build
//! registers records the parent it was built on and the candidate
//! configuration of the step that produced it, so probing means
//! recomputing the key for each child of the parent and comparing.
//!
//! # Key inputs
//!
//! | Input | Why it matters |
//! |-------|----------------|
//! | Parent image id | Same step on a different base is a different layer |
//! | Candidate config | Command, env, source hash and every other field |
//! | Platform triple | Keeps foreign-architecture results apart |

pub mod key;
pub mod probe;

pub use key::CacheKey;
pub use probe::{new_prober, ImageProber, NoCacheProber, StoreProber};
