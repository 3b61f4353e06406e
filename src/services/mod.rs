//! Services layer: the execution engine and its collaborators.

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod eviction;
pub mod merge_queue;
pub mod pipeline;
pub mod prompts;
pub mod reconciler;
pub mod resume;
pub mod scheduler;
pub mod tree;
pub mod workflow;

pub use config::{Config, ConfigError};
pub use context::FrameSnapshot;
pub use engine::{Engine, RenderCtx, RunOutcome, RunReport, WorkflowDef};
pub use merge_queue::{MergeCoordinator, MergeQueueSettings, OrderingStrategy, ReadyTicket};
pub use tree::{LoopStates, Node};
pub use workflow::SuperRalphWorkflow;
