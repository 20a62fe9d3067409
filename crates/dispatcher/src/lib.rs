//! Publishing side of jobmq.
//!
//! A [`Dispatcher`] publishes a batch of jobs to a shared work queue,
//! collects the results workers send back to its private reply queue,
//! and notifies [`JobCompleteListener`]s as each job resolves.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listener;

pub use config::{DispatchMode, DispatcherConfig};
pub use dispatcher::{Dispatcher, Submission};
pub use error::DispatchError;
pub use listener::{JobCompleteEvent, JobCompleteListener, ListenerId};
