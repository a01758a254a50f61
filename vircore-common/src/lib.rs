//! Shared logging initialization for vircore binaries.
//!
//! ```no_run
//! vircore_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_file};
