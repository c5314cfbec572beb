//! BPMN 2.0 graph parsing and validation.
//!
//! [`parser::parse`] turns BPMN XML (plus the pythmata extension namespace)
//! into an immutable [`model::ProcessGraph`]; [`validate::validate`] is the
//! non-throwing variant that collects coded errors. Cycle detection is a
//! separate pass run before execution.

pub mod model;
pub mod parser;
pub mod validate;

pub use model::*;
pub use parser::parse;
pub use validate::{detect_cycles, validate, ValidationCode, ValidationError, ValidationResult};
