//! Constellation Fuzz Harness
//!
//! Reusable property-based testing strategies for the constellation
//! routing workspace: traffic, link, orbital and topology generators.
//!
//! # Usage
//!
//! ```rust
//! use fuzz_harness::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_fuzz_test(size in message_size(), speed in link_speed()) {
//!         prop_assert!(transfer_seconds(size, speed) > 0.0);
//!     }
//! }
//! ```

pub mod generators;

pub mod prelude {
    pub use crate::generators::*;
    pub use proptest::prelude::*;
}

// Re-export proptest for convenience
pub use proptest;
