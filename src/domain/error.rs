use crate::domain::models::ConnectionState;
use thiserror::Error;

/// Failures surfaced by the scanner, the GATT session and the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    /// The permission gate refused; nothing was sent to the stack.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Connection error: {0}")]
    ConnectError(String),

    #[error("Operation not allowed in state {0}")]
    InvalidState(ConnectionState),

    /// Immediate rejection of a request by the platform stack
    #[error("Bluetooth stack error: {0}")]
    Stack(String),

    /// Only ever logged; callers never see this returned.
    #[error("Unexpected {event} callback in state {state}")]
    UnexpectedCallback {
        state: ConnectionState,
        event: &'static str,
    },
}

impl BleError {
    /// A rejected link request already shows up as `Failed(ConnectError)`.
    ///
    /// Later setup failures (not found, discovery, subscribe) never come back
    /// as errors; they exist only as the `FailureReason` of the terminal state.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::ConnectError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::FailureReason;

    #[test]
    fn test_only_link_errors_are_terminal() {
        assert!(BleError::ConnectError("refused".to_string()).is_terminal_failure());
        assert!(!BleError::PermissionDenied.is_terminal_failure());
        assert!(!BleError::Stack("busy".to_string()).is_terminal_failure());
        assert!(!BleError::InvalidState(ConnectionState::Ready).is_terminal_failure());
        assert!(!BleError::InvalidState(ConnectionState::Failed(FailureReason::NotFound))
            .is_terminal_failure());
    }
}
