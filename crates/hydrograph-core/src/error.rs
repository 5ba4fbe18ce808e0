//! Error types shared across the Hydrograph workspace.
//!
//! [`ConfigError`] covers option-set problems detected at construction.
//! [`StateError`] covers the dependency-graph engine: ownership conflicts,
//! unresolved or stale reads, unsupported derivatives, and cycles. Both are
//! fatal; soft numerical failures are modelled separately by the time
//! integrator.

use std::error::Error;
use std::fmt;

use crate::id::KeyTag;

/// A missing, mistyped, or conflicting configuration option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required option is absent.
    MissingParameter {
        /// Name of the parameter list searched.
        list: String,
        /// The missing option.
        name: String,
    },
    /// An option exists but has the wrong type.
    WrongType {
        /// Name of the parameter list.
        list: String,
        /// The offending option.
        name: String,
        /// What was expected, e.g. `"bool"`.
        expected: &'static str,
    },
    /// An option has a value outside its accepted set or range.
    InvalidValue {
        /// Name of the parameter list.
        list: String,
        /// The offending option.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Two or more options contradict each other.
    Conflict {
        /// Description of the conflict.
        reason: String,
    },
    /// A factory was asked for a type it has no constructor for.
    UnknownType {
        /// The requested type name.
        type_name: String,
    },
    /// Parameter text could not be parsed.
    Parse {
        /// Parser diagnostic.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParameter { list, name } => {
                write!(f, "parameter list '{list}' is missing required option '{name}'")
            }
            Self::WrongType {
                list,
                name,
                expected,
            } => write!(f, "option '{name}' in '{list}' must be a {expected}"),
            Self::InvalidValue { list, name, reason } => {
                write!(f, "invalid value for '{name}' in '{list}': {reason}")
            }
            Self::Conflict { reason } => write!(f, "conflicting options: {reason}"),
            Self::UnknownType { type_name } => write!(f, "unknown type '{type_name}'"),
            Self::Parse { reason } => write!(f, "cannot parse parameters: {reason}"),
        }
    }
}

impl Error for ConfigError {}

/// Errors raised by the state store and evaluators.
#[derive(Clone, Debug, PartialEq)]
pub enum StateError {
    /// Configuration failure while building or registering an evaluator.
    Config(ConfigError),
    /// A field was read or required but nothing can produce it.
    UnresolvedDependency {
        /// The field with no evaluator and no primary source.
        field: KeyTag,
    },
    /// A field was read before it was brought up to date.
    StaleDependency {
        /// The evaluator (or caller) doing the read.
        consumer: String,
        /// The field that was not up to date.
        field: KeyTag,
    },
    /// An evaluator read a field it did not declare as a dependency.
    UndeclaredDependency {
        /// The evaluator doing the read.
        consumer: String,
        /// The undeclared field.
        field: KeyTag,
    },
    /// An evaluator cannot differentiate with respect to `wrt`.
    UnsupportedDerivative {
        /// Name of the evaluator.
        evaluator: String,
        /// The field being differentiated.
        of: KeyTag,
        /// The independent variable.
        wrt: KeyTag,
    },
    /// The evaluator graph contains a cycle.
    CyclicDependency {
        /// Fields along the cycle, first repeated at the end.
        cycle: Vec<KeyTag>,
    },
    /// A second owner was registered for an already-owned field.
    DuplicateOwner {
        /// The contested field.
        field: KeyTag,
        /// The owner already registered.
        existing: String,
        /// The owner that was rejected.
        requested: String,
    },
    /// Field shapes or vector layouts disagree.
    ShapeMismatch {
        /// Description of the mismatch.
        reason: String,
    },
    /// A primary write targeted a field owned by a secondary evaluator.
    NotPrimary {
        /// The field.
        field: KeyTag,
        /// Its owning evaluator.
        owner: String,
    },
    /// A field or mesh was named that the store does not know.
    UnknownField {
        /// The field.
        field: KeyTag,
    },
    /// A mesh domain was named that has not been registered.
    UnknownDomain {
        /// The domain name.
        domain: String,
    },
    /// The operation is not valid in the store's current phase.
    WrongPhase {
        /// What was attempted.
        operation: &'static str,
        /// Whether the store was already set up.
        sealed: bool,
    },
    /// An evaluator's compute step failed.
    EvaluationFailed {
        /// Name of the evaluator.
        evaluator: String,
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::UnresolvedDependency { field } => {
                write!(f, "no evaluator or primary source for {field}")
            }
            Self::StaleDependency { consumer, field } => {
                write!(f, "'{consumer}' read {field} before it was updated")
            }
            Self::UndeclaredDependency { consumer, field } => {
                write!(f, "'{consumer}' read {field} without declaring it")
            }
            Self::UnsupportedDerivative { evaluator, of, wrt } => {
                write!(f, "evaluator '{evaluator}' cannot provide d{of}/d{wrt}")
            }
            Self::CyclicDependency { cycle } => {
                write!(f, "cyclic dependency: ")?;
                for (i, kt) in cycle.iter().enumerate() {
                    if i > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{kt}")?;
                }
                Ok(())
            }
            Self::DuplicateOwner {
                field,
                existing,
                requested,
            } => write!(
                f,
                "{field} is owned by '{existing}', cannot also be owned by '{requested}'"
            ),
            Self::ShapeMismatch { reason } => write!(f, "shape mismatch: {reason}"),
            Self::NotPrimary { field, owner } => {
                write!(f, "{field} is computed by '{owner}' and cannot be set directly")
            }
            Self::UnknownField { field } => write!(f, "unknown field {field}"),
            Self::UnknownDomain { domain } => write!(f, "unknown mesh domain '{domain}'"),
            Self::WrongPhase { operation, sealed } => {
                let phase = if *sealed { "after" } else { "before" };
                write!(f, "'{operation}' is not allowed {phase} setup")
            }
            Self::EvaluationFailed { evaluator, reason } => {
                write!(f, "evaluator '{evaluator}' failed: {reason}")
            }
        }
    }
}

impl Error for StateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for StateError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Key, Tag};

    #[test]
    fn cycle_display_lists_path() {
        let a = Key::from("a").at(&Tag::NEXT);
        let b = Key::from("b").at(&Tag::NEXT);
        let err = StateError::CyclicDependency {
            cycle: vec![a.clone(), b, a],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a@next -> b@next -> a@next");
    }

    #[test]
    fn config_error_is_source() {
        let err: StateError = ConfigError::UnknownType {
            type_name: "nope".into(),
        }
        .into();
        assert!(err.source().is_some());
    }
}
