#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! `KeyManager`, `RequestRouter`, `ConversationStore`, `SecretStore` and
//! LLM provider-client implementations (§4.2-§4.4, §6).

pub mod conversation_store;
pub mod key_manager;
pub mod providers;
pub mod request_router;
pub mod sanitize;
pub mod secret_store;

pub use conversation_store::InMemoryConversationStore;
pub use key_manager::RedisKeyManager;
pub use providers::ProviderRegistry;
pub use request_router::DefaultRequestRouter;
pub use secret_store::{build_secret_store, EnvSecretStore, SecretStore};
