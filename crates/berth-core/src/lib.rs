//! Berth Core - Core types shared by the release engine and the operator
//!
//! This crate provides the foundational types used throughout Berth:
//! - `Chart`: A template bundle with metadata and default values
//! - `Values`: Configuration values with deep merge support
//! - `ReleaseStatus` / `ReleaseInfo`: Release status and template-facing release data

pub mod chart;
pub mod error;
pub mod release;
pub mod values;

pub use chart::{Chart, ChartMetadata};
pub use error::{CoreError, Result};
pub use release::{ReleaseInfo, ReleaseStatus};
pub use values::Values;
