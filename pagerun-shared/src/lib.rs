//! Types shared between the pagerun engine and its front ends.

pub mod errors;

pub use errors::{PagerunError, PagerunResult};
