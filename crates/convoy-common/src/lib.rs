//! # Convoy Common
//!
//! Shared types, errors, and protocol constants used across Convoy components.
//!
//! ## Modules
//! - `types` - Node records, file manifests, comparison results
//! - `error` - Common error taxonomy
//! - `constants` - Defaults, command names, bundle layout

pub mod constants;
pub mod error;
pub mod types;

pub use error::ConvoyError;
pub use types::*;
