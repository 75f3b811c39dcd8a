//! Berth Engine - Jinja2 templating for Kubernetes
//!
//! This crate provides a MiniJinja-based template engine with:
//! - Kubernetes-specific filters (toyaml, b64encode, nindent, ...)
//! - Deterministic multi-document output for a whole chart
//! - Template errors carrying source spans for diagnostics

pub mod engine;
pub mod error;
pub mod filters;

pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result, TemplateError};
