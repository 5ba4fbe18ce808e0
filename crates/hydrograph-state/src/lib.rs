//! Field records, evaluators, and the dependency-graph state store.
//!
//! The [`StateStore`] owns every `(key, tag)` [`FieldRecord`] and every
//! [`Evaluator`]. Fields are computed on demand: asking for a field walks
//! its dependencies depth-first and recomputes only what changed since the
//! last request, tracked by per-record version counters.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod evaluator;
pub mod factory;
pub mod primary;
pub mod record;
pub mod store;

pub use evaluator::{EvalContext, Evaluator, EvaluatorKind};
pub use factory::{EvaluatorCtor, EvaluatorFactory, TYPE_KEY};
pub use primary::{read_io_flags, ConstantEvaluator, PrimaryVariable};
pub use record::{FieldRecord, IoFlags, IoKind, Owner};
pub use store::StateStore;
