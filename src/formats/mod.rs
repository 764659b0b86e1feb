//! Vocabulary export parsing - tab-delimited rows and typed cells

pub mod cast;
pub mod delimited;

pub use cast::{CellValue, RowCaster};
pub use delimited::TsvReader;
