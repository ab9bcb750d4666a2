//! fdrlog - Embedded flight data recorder
//!
//! Plugins feed a single growing log file through LZ4 compression and
//! optional envelope encryption, under disk space and file size budgets.
//! The reader rebuilds header fields, events and telemetry series from it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod logger;
pub mod reader;
pub mod storage;

pub use error::{FdrError, Result};
