//! Common test utilities for spiderq integration tests

#[allow(dead_code)]
pub mod fixtures;

pub use fixtures::*;
