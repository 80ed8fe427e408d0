//! Core abstractions shared by the loader and the migrators.
//!
//! - [`traits`]: the [`SqlExecutor`] seam every component talks through
//! - [`value`]: owned SQL values and rows
//! - [`identifier`]: identifier validation and literal quoting

pub mod identifier;
pub mod traits;
pub mod value;

pub use traits::SqlExecutor;
pub use value::{Row, SqlValue};
