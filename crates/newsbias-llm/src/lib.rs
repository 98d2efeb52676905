//! NewsBias LLM — model provider gateway for ensemble bias scoring.
//!
//! Each roster entry names a model, an optional perspective and the provider
//! family that serves it. Calls are plain request/response (no streaming);
//! models are asked for a small JSON verdict that is parsed into
//! [`ModelOutput`].

pub mod config;
pub mod gateway;
pub mod providers;
pub mod types;

pub use config::ModelRosterConfig;
pub use gateway::Gateway;
pub use providers::ScoreProvider;
pub use types::*;
