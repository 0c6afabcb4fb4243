//! hangman: single-instance coordinator with a bounded parallel job queue.
//!
//! The first launch of a program becomes the primary; later launches forward
//! their invocation to it over a local socket and exit.

pub mod bridge;
pub mod config;
pub mod instance;
pub mod job;
pub mod multiplexer;
pub mod queue;

pub use bridge::{Envelope, EnvelopeError};
pub use config::{ConfigError, CoordinatorConfig, ReplyMode};
pub use instance::{
    ExitHandle, InstanceError, InvocationHandler, PrimaryInstance, ProcessIdentity, Role,
    SecondaryInstance, elect,
};
pub use job::{CommandJob, Job, JobError, JobExit, JobStatus};
pub use multiplexer::{Multiplexer, MultiplexerError, ServerEvent};
pub use queue::{EntryId, EntrySnapshot, ExecutionQueue, QueueEntry, QueueError, run_admitted};
