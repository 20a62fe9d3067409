use std::fmt;

/// Lifecycle of an [`Engine`](crate::Engine).
///
/// `Stopped -> Connecting -> Running <-> Paused -> Stopped`. A failed
/// connection attempt returns to `Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EngineState {
    #[default]
    Stopped,
    Connecting,
    Running,
    Paused,
}

impl EngineState {
    /// Connected and consuming, whether or not deliveries are being handled.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}
