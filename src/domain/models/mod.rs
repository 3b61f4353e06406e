//! Domain model types.

pub mod agent;
pub mod job;
pub mod merge;
pub mod output;
pub mod schedule;
pub mod ticket;

pub use agent::{merge_queue_agent, scheduler_agent, AgentPool, AgentSpec};
pub use job::{ActiveJob, JobType};
pub use merge::{EvictionContext, EvictionReason, LandRecord, MergeEntry};
pub use output::OutputRow;
pub use schedule::{RateLimitedAgent, ScheduledJob, TicketSchedule};
pub use ticket::{stage_node_id, ComplexityTier, Priority, Severity, Stage, Ticket, WorkStatus};
