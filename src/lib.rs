//! Finance Chat Engine
//!
//! A conversational finance engine that:
//! - Turns free-text Spanish messages into validated financial records
//! - Delegates reasoning to an external assistant over a thread/run protocol
//! - Dispatches tool calls to transaction, budget, and goal CRUD
//! - Resolves categories diacritic-insensitively with suggestions on a miss
//! - Normalizes relative and long-form Spanish dates per user timezone
//! - Meters conversational turns against the user's plan
//!
//! TURN LOOP:
//! MESSAGE → SESSION → RUN → POLL → TOOL CALLS → OUTPUTS → REPLY

pub mod api;
pub mod assistant;
pub mod category;
pub mod criteria;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod models;
pub mod poller;
pub mod records;
pub mod session;
pub mod store;
pub mod temporal;
pub mod usage;

pub use error::{EngineError, Result};

// Re-export common types
pub use engine::{ChatEngine, TurnOutcome, TurnRequest};
pub use models::*;
