//! HTCondor-style ClassAd expression layer
//!
//! This module provides:
//! - An expression AST with three-valued (`Undefined`-aware) evaluation
//! - A parser for single expressions and `name = expr` attribute sets
//! - `my.*` / `target.*` scoped attribute resolution against pluggable
//!   attribute sources
//! - The `quantize` rounding used for autoclustering keys

pub mod expr;
pub mod parse;

pub use expr::{evaluate, quantize, AttrScope, AttributeSource, BinOp, Expr, UnOp, Value};
pub use parse::{parse_classad, parse_expression, ClassAd, ParseError};
