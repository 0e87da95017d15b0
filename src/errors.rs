use colored::*;
use derive_more::{Display, Error, From};

use crate::types::Name;

pub type RttiResult<T> = Result<T, RttiError>;

/// The checked program is unsound at this point.
///
/// These are raised at the exact operation that detects them and carry the
/// printed actual and expected types, so the embedding program can report
/// where a value crossed a static/dynamic boundary with the wrong shape.
#[derive(Clone, Debug, PartialEq, Display, Error)]
pub enum TypeViolation {
    #[display(fmt = "value of type {} is not a {}", actual, expected)]
    TypeMismatch { actual: String, expected: String },

    #[display(fmt = "value of type {} is not an instance of {}", actual, expected)]
    InstanceCheckFailed { actual: String, expected: String },

    #[display(fmt = "fixed type {} cannot be viewed as {}", actual, expected)]
    FixedTypeMismatch { actual: String, expected: String },

    #[display(fmt = "{} must be a subtype of {}", actual, expected)]
    SubtypeRequired { actual: String, expected: String },

    #[display(fmt = "value of fixed type {} cannot take on structure {}", actual, expected)]
    StructuredFromFixedType { actual: String, expected: String },

    #[display(fmt = "field `{}` has type {} but {} was expected", field, actual, expected)]
    FieldOverlapMismatch { field: Name, actual: String, expected: String },

    #[display(fmt = "{} is not a subtype of the overlapping part of {}", actual, expected)]
    OverlapSubtypeFailure { actual: String, expected: String },

    #[display(fmt = "call expected {} to {} arguments but got {}", mandatory, max, found)]
    ArityMismatch { mandatory: usize, max: MaxArity, found: usize },

    #[display(fmt = "cannot access `{}` on {}", field, receiver)]
    NullReceiver { field: Name, receiver: String },

    #[display(fmt = "`{}` is a method of {} and cannot be used as a field", field, ty)]
    MethodAsField { field: Name, ty: String },

    #[display(fmt = "{} has no field `{}`", ty, field)]
    UnknownField { field: Name, ty: String },

    #[display(fmt = "{} has no method `{}`", ty, method)]
    UnknownMethod { method: Name, ty: String },

    #[display(fmt = "field `{}` of {} is not writable", field, ty)]
    ImmutableField { field: Name, ty: String },

    #[display(fmt = "{} must be indexed by a number, not `{}`", ty, key)]
    IndexNotNumeric { key: String, ty: String },

    #[display(fmt = "index {} is too far past the end of {} ({} elements)", index, ty, len)]
    IndexOutOfRange { index: usize, len: usize, ty: String },

    #[display(fmt = "`{}` of type {} is not callable", method, ty)]
    NotCallable { method: Name, ty: String },

    #[display(fmt = "field `{}` of type {} does not support arithmetic", field, ty)]
    NonNumericOperand { field: Name, ty: String },
}

/// Upper bound of an arrow's accepted argument count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum MaxArity {
    #[display(fmt = "{}", _0)]
    Bounded(usize),
    #[display(fmt = "any number of")]
    Unbounded,
}

/// Unreachable if the static checker and this runtime agree on the type algebra.
#[derive(Clone, Debug, PartialEq, Display, Error)]
pub enum InvariantViolation {
    #[display(fmt = "type `{}` was registered twice", name)]
    DuplicateRegistration { name: Name },

    #[display(fmt = "type `{}` was registered after the registry was frozen", name)]
    RegistryFrozen { name: Name },

    #[display(
        fmt = "`{}` is already known as a {} and cannot be used as a {}",
        name,
        known,
        requested
    )]
    KindMismatch { name: Name, known: String, requested: String },

    #[display(fmt = "named type `{}` was used before its registration completed", name)]
    UnresolvedNamedType { name: Name },

    #[display(fmt = "{} can never be a coercion target", target)]
    CoercionTarget { target: String },

    #[display(fmt = "{} can never be a coercion source", source_ty)]
    DottedSource { source_ty: String },

    #[display(fmt = "field `{}` resolved to dotted type {}", field, ty)]
    DottedFieldAccess { field: Name, ty: String },

    #[display(fmt = "{}", _0)]
    Impossible(#[error(not(source))] String),
}

#[derive(Clone, Debug, PartialEq, Display, Error, From)]
pub enum RttiError {
    #[display(fmt = "type error: {}", _0)]
    User(TypeViolation),

    #[display(fmt = "internal invariant violated: {}", _0)]
    Internal(InvariantViolation),
}

impl RttiError {
    /// True when this points at a bug in the checker/runtime pairing rather
    /// than in the checked program.
    pub fn is_internal(&self) -> bool {
        matches!(self, RttiError::Internal(_))
    }

    pub fn violation(&self) -> Option<&TypeViolation> {
        match self {
            RttiError::User(v) => Some(v),
            RttiError::Internal(_) => None,
        }
    }

    pub fn invariant(&self) -> Option<&InvariantViolation> {
        match self {
            RttiError::User(_) => None,
            RttiError::Internal(i) => Some(i),
        }
    }
}

pub struct ErrorPrinter {}

impl ErrorPrinter {
    pub fn report(&self, context: &str, err: &RttiError) {
        self.print_bar();

        let heading = if err.is_internal() {
            "internal error".bold().bright_magenta()
        } else {
            "error".bold().bright_red()
        };

        println!("{}: {}", heading, context.bold().bright_yellow());

        let detail = match err {
            RttiError::User(v) => v.to_string(),
            RttiError::Internal(i) => i.to_string(),
        };
        println!("   {} {}", ">".bright_blue().bold(), detail.bright_yellow().bold());

        if err.is_internal() {
            self.note_line(
                "the static checker and the runtime disagree, the checked program is not at fault"
                    .to_owned(),
            );
        }
    }

    pub fn note_line(&self, line: String) {
        println!(
            "{}",
            "This additional information was given for solving the issue:".yellow().bold()
        );
        println!("   {} {}", ">".bright_blue().bold(), line.bright_yellow().bold());
    }

    pub fn success(&self, context: &str, outcome: &str) {
        println!("{} {}: {}", "ok".bold().bright_green(), context.bold(), outcome);
    }

    pub fn print_bar(&self) {
        println!();
        if let Some((w, _)) = term_size::dimensions() {
            for _ in 0..w {
                print!("{}", "―".cyan());
            }
        }
        println!();
    }
}
