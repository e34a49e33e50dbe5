//! Common types.

pub mod uuid;
