#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Trait contracts shared by every subsystem of the orchestrator core:
//! `Agent`, `Orchestrator`/`IterativeLoop`, `RequestRouter`, `KeyManager`,
//! `ConversationStore`, `Planner` and `MessageBus`. Concrete
//! implementations live in `polyagent-bus`, `polyagent-router`,
//! `polyagent-planner`, `polyagent-orchestrator` and `polyagent-agents`;
//! this crate only fixes the shapes they agree on (Design Note §9
//! "Global singletons -> explicit injection": every component here is
//! constructed and passed in, never reached through a process-global).

pub mod agent;
pub mod bus;
pub mod conversation;
pub mod key_manager;
pub mod orchestrator;
pub mod planner;
pub mod router;

pub use agent::{Agent, AgentHealth};
pub use bus::{EventHandler, MessageBus, SubscriptionId};
pub use conversation::ConversationStore;
pub use key_manager::{KeyManager, KeyManagerHealth, KeySelectionRequest, KeyStatus, SelectedKey};
pub use orchestrator::{IterationRecord, IterativeLoop, IterativeReport, Orchestrator, WorkflowSummary};
pub use planner::{PlanContext, PlanOutcome, Planner};
pub use router::{
    ChatMessage, CompletionOutcome, CompletionParams, CompletionRequest, ProviderClient, ProviderCompletion, ProviderError,
    RequestRouter, SafetyRatings,
};
