//! # layercake-common
//!
//! Shared types for the layercake overlay layer manager.
//!
//! This crate carries the pieces that have no side effects on the live system:
//! - Layer name validation
//! - The on-disk layout of a layercake base path
//! - Symbolic path resolution for layer definitions
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;
pub mod resolve;

pub use error::{LayerError, LayerResult};
pub use name::LayerName;
pub use paths::LayerPaths;
pub use resolve::PathResolver;
