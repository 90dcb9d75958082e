//! Flow Execution Engine (C7): flow definition storage plus the per-turn
//! node dispatch loop, including composite (sub-flow) expansion.

pub mod engine;
pub mod store;

pub use engine::{FlowEngine, QuestionPrompt, TurnOutcome};
pub use store::{FlowStore, InMemoryFlowStore};
