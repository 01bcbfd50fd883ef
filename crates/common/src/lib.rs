#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared types, error taxonomy, configuration and observability for the
//! Polyagent orchestrator core.

pub mod classify;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub use classify::{classify_failure, Classification, FailureKind};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
