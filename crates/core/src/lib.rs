//! Shared data model for the jobmq dispatcher and workers.
//!
//! - [`Job`], [`JobResult`], [`JobSlot`]: units of work and their outcome.
//! - [`JobBatchEnvelope`]: the correlation envelope carried by every message.
//! - [`convert`]: pluggable converters between values and message bodies.
//! - [`config`]: broker connection settings loaded from the environment.
//! - [`error`]: serialization, configuration and cleanup errors.

pub mod config;
pub mod convert;
pub mod envelope;
pub mod error;
pub mod job;

pub use config::ConnectionConfig;
pub use convert::{
    Converter, EnvelopeCodec, JsonConverter, LossyStringConverter, ReceiveConverter,
    StringConverter,
};
pub use envelope::JobBatchEnvelope;
pub use error::{CleanupError, ConfigError, SerializationError};
pub use job::{Job, JobResult, JobSlot};
