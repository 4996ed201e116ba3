// ── Core error type ──
//
// Every failure the client, the command protocol, or an orchestrator
// can hand back to its caller. Orchestrators never unwind on these:
// they log them and turn them into machine events.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection ──────────────────────────────────────────────────
    /// The connect sequence failed at one of its steps.
    #[error("Connect to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The operation needs a session and there is none.
    #[error("Client is not connected")]
    Disconnected,

    // ── Field access ────────────────────────────────────────────────
    #[error("{}Fail to read {field}: {reason}", tag(.phase))]
    Read {
        phase: Option<String>,
        field: String,
        reason: String,
    },

    #[error("{}Fail to write {field}: {reason}", tag(.phase))]
    Write {
        phase: Option<String>,
        field: String,
        reason: String,
    },

    /// Unexpected value type, failed precondition, or a missing field.
    #[error("{}{message}", tag(.phase))]
    Validation {
        phase: Option<String>,
        field: String,
        message: String,
    },

    // ── State machines ──────────────────────────────────────────────
    /// An event arrived in a state that does not expect it.
    #[error("{machine}: {event} is not accepted in state {state}")]
    ProtocolSequence {
        machine: &'static str,
        state: String,
        event: String,
    },

    /// Equipment fault reported from outside the protocol.
    #[error("Device fault: {message}")]
    DeviceFault { message: String },

    // ── Internal ────────────────────────────────────────────────────
    /// The producer went away without completing the operation.
    #[error("Operation abandoned before completion")]
    Abandoned,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Api(#[from] cellink_api::Error),
}

#[allow(clippy::ref_option)]
fn tag(phase: &Option<String>) -> String {
    phase.as_ref().map_or_else(String::new, |p| format!("{p} "))
}

impl CoreError {
    pub(crate) fn read(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::Read {
            phase: None,
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::Write {
            phase: None,
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            phase: None,
            field: field.into(),
            message: message.into(),
        }
    }

    /// Tag a field error with the protocol phase it occurred in.
    ///
    /// Errors that do not concern a field are attached to `field` so the
    /// phase and field always show up in logs.
    #[must_use]
    pub fn in_phase(self, phase: &str, field: &str) -> Self {
        let phase = Some(phase.to_owned());
        match self {
            Self::Read { field, reason, .. } => Self::Read { phase, field, reason },
            Self::Write { field, reason, .. } => Self::Write { phase, field, reason },
            Self::Validation { field, message, .. } => Self::Validation {
                phase,
                field,
                message,
            },
            other => Self::Validation {
                phase,
                field: field.to_owned(),
                message: format!("{field}: {other}"),
            },
        }
    }

    /// The field this error names, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Read { field, .. } | Self::Write { field, .. } | Self::Validation { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }

    /// Returns `true` if the session went away or may come back by itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Disconnected => true,
            Self::Api(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tag_prefixes_message() {
        let err = CoreError::validation("InitExecuteState", "InitExecuteState = 1")
            .in_phase("[init][check state]", "InitExecuteState");
        assert_eq!(err.to_string(), "[init][check state] InitExecuteState = 1");
        assert_eq!(err.field(), Some("InitExecuteState"));
    }

    #[test]
    fn untagged_read_has_no_prefix() {
        let err = CoreError::read("DeviceType", "BadNodeIdUnknown");
        assert_eq!(err.to_string(), "Fail to read DeviceType: BadNodeIdUnknown");
    }

    #[test]
    fn non_field_errors_are_wrapped_with_the_field() {
        let err = CoreError::Disconnected.in_phase("[send execute command]", "InitCommand");
        assert_eq!(
            err.to_string(),
            "[send execute command] InitCommand: Client is not connected"
        );
    }
}
