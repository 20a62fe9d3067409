//! Consuming side of jobmq.
//!
//! An [`Engine`] pulls deliveries from the broker, parses them into
//! commands with a [`CommandProcessor`], and runs permitted commands on a
//! bounded [`WorkerPool`]. [`JobResponder`] is the handler that speaks the
//! dispatcher protocol; [`ShellJob`] is the job type the binary serves.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod registry;
pub mod responder;
pub mod shell;
pub mod state;

pub use command::{
    AllowAll, CommandProcessor, Handler, HandlerContext, Incoming, LogRejections, Permitter,
    RemoteCommand, Replier, RequestHandler,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{CommandError, EngineError};
pub use pool::WorkerPool;
pub use registry::{EngineRegistry, ManagedEngine, DEFAULT_ENGINE};
pub use responder::{JobCommand, JobCommandProcessor, JobResponder};
pub use shell::ShellJob;
pub use state::EngineState;
