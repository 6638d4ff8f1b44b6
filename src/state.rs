//! Session finite-state-machine types.
//!
//! Both sides of the control relationship run a small FSM per measurement.
//! State transitions are *not* implemented here — the coordinator side lives
//! in [`crate::peer`], the agent side in [`crate::client`] — but keeping the
//! state types in their own module makes it easy to add guard logic or
//! tracing without touching session plumbing.

/// Coordinator-side state of one peer.
///
/// ```text
///  Idle ──SetCommand──▶ Negotiating ──mode reply──▶ AwaitAck
///                           │  (multicast skips the reply)
///  AwaitAck ──ack──▶ Running ──engine done──▶ AwaitResult ──result──▶ Idle
///     any ──timeout / transport error──▶ Failed ──cleanup──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No command in flight; new commands are accepted.
    #[default]
    Idle,
    /// Mode line sent; waiting for the agent's data-port reply.
    Negotiating,
    /// Command line sent; waiting for the agent's `ack`.
    AwaitAck,
    /// The measurement engine is emitting / collecting.
    Running,
    /// `stop` sent; waiting for the agent's `result`.
    AwaitResult,
    /// The command was aborted; the peer cleans up and returns to `Idle`.
    Failed,
}

impl PeerState {
    /// A new command may only start from `Idle`; anything else refuses it.
    pub fn accepts_command(self) -> bool {
        self == PeerState::Idle
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Agent-side mirror of [`PeerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    /// Waiting for a mode line or a command.
    #[default]
    Idle,
    /// Data socket is set up; waiting for the measurement command.
    Ready,
    /// Receive-side engine is running; waiting for `stop`.
    Running,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_accepts_commands() {
        assert!(PeerState::Idle.accepts_command());
        for s in [
            PeerState::Negotiating,
            PeerState::AwaitAck,
            PeerState::Running,
            PeerState::AwaitResult,
            PeerState::Failed,
        ] {
            assert!(!s.accepts_command(), "{s} must refuse commands");
        }
    }
}
