//! Queries the static checker makes while validating programs, before any
//! value exists.

pub mod tuple;

pub use tuple::*;
