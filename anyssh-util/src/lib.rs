#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Small runtime helpers shared by the `anyssh` crates.

pub mod runtime;
pub mod watchdog;
