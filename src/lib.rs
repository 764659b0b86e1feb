// Public API - the runner, plus the types its callers inspect
pub mod catalog;
pub mod error;
pub mod runner;

// Internal modules - organized by subsystem
mod config;
mod coordination;
mod db;
mod formats;
mod io;
mod telemetry;

#[cfg(test)]
mod integ_tests;
