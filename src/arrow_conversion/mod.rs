//! Arrow data format conversion utilities.
//!
//! This module reads individual cells out of Arrow column vectors and converts
//! them into [`TypedValue`](crate::types::TypedValue)s on demand.

mod accessor;

pub use accessor::{read_natural, read_value};
