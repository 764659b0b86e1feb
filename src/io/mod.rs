//! Local file access - discovering export files and mapping them onto tables

pub mod mapper;

pub use mapper::{FileMapper, SourceFile};
