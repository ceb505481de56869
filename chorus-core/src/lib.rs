//! Core runtime for a multi-agent workflow: the channel/context store, the
//! per-agent controller state machine, proposal voting, and the workflow
//! scheduler that ties them together.

pub mod channel;
pub mod controller;
pub mod event_log;
pub mod message;
pub mod proposal;
pub mod scheduler;
pub mod storage;
pub mod workflow;

pub use channel::{ChannelError, ChannelStore, ReadFilter, StoreStats};
pub use controller::{AgentController, Backend, BackendError, BackendReply, ControllerState, RetryPolicy};
pub use event_log::EventLog;
pub use message::{Message, MessageKind, ToolCallInfo};
pub use proposal::{Proposal, ProposalError, ProposalManager, ProposalSpec, ProposalStatus};
pub use scheduler::{MentionSink, SchedulerError, WorkflowScheduler};
pub use storage::{DiskStorage, MemoryStorage, Storage, StorageError};
pub use workflow::{AgentDeclaration, BackendKind, Kickoff, ParsedWorkflow, SetupTask};
