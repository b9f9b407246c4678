//! The capture state machine.

/// Lifecycle state of one capture stream.
///
/// ```text
/// WaitingForFormat -> OperatingSync <-> OperatingAsync -> AsyncStopping
///        |                  ^                                  |
///        |                  +---- AsyncStoppingCallbackPending +
///        +--> ShutDown (from any state, terminal)
/// ```
///
/// The state is owned by the mix context; the control context observes it
/// only through command replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created; waiting for a stream format and a bound payload buffer.
    WaitingForFormat,
    /// Buffer bound; client drives capture with explicit `CaptureAt`.
    OperatingSync,
    /// Engine synthesizes fixed-size packets continuously.
    OperatingAsync,
    /// Async stop requested; the mix context is finishing its last cycle.
    AsyncStopping,
    /// Mix context acknowledged the stop; delivery is completing the
    /// client-visible handoff.
    AsyncStoppingCallbackPending,
    /// Terminal: explicit shutdown or fatal error.
    ShutDown,
}

impl State {
    /// True in the two states where the mix loop runs normally.
    pub fn is_operating(&self) -> bool {
        matches!(self, Self::OperatingSync | Self::OperatingAsync)
    }

    /// True once the stream has terminated.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}
