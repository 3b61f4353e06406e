//! Agent subprocess infrastructure.

mod extract;
mod invoker;
mod review_gate;

pub use extract::extract_json;
pub use invoker::{AgentInvoker, AgentTaskSpec, SubprocessAgentExecutor, MAX_STDOUT_BYTES};
pub use review_gate::AgentReviewGate;
