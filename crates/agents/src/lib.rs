#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Concrete `Agent` handlers for the four roles the orchestrator dispatches
//! to (§4.7): Architect, Coder, Tester, Debugger. Each implements the same
//! `(request) -> result` shape, tagged by `AgentRole` rather than dispatched
//! through subclassing.

pub mod architect;
pub mod coder;
pub mod debugger;
pub mod tester;

pub use architect::Architect;
pub use coder::Coder;
pub use debugger::Debugger;
pub use tester::Tester;
