//! Runtime type information for a gradually typed object language.
//!
//! Values carry a mutable type tag. Coercions at static/dynamic boundaries
//! check a value against a target type and record what the tag has to
//! remember; guarded field accesses and calls go through the same checks.

pub mod check;
pub mod config;
pub mod errors;
pub mod rtti;
pub mod types;

pub use config::EngineConfig;
pub use errors::{RttiError, RttiResult, TypeViolation, InvariantViolation};
pub use rtti::Runtime;
