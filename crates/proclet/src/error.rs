//! Failures raised on the far side of the channel.

use std::any::Any;

use crate::bridge::protocol::ErrorEnvelope;

/// An error reconstructed from its [`ErrorEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteError {
    pub const DEFAULT_NAME: &'static str = "Error";

    pub fn new(message: impl Into<String>) -> Self {
        Self::named(Self::DEFAULT_NAME, message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Message falls back from `message` to `error` to `"Unknown error"`.
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        Self {
            name: envelope
                .name
                .unwrap_or_else(|| Self::DEFAULT_NAME.to_string()),
            message: envelope
                .message
                .or(envelope.error)
                .unwrap_or_else(|| "Unknown error".to_string()),
            stack: envelope.stack,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            name: Some(self.name.clone()),
            message: Some(self.message.clone()),
            stack: self.stack.clone(),
            error: None,
        }
    }
}

impl From<ErrorEnvelope> for RemoteError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self::from_envelope(envelope)
    }
}

/// Wire form of a caught panic: a bare `{error}` with the panic text.
pub(crate) fn panic_envelope(payload: Box<dyn Any + Send>) -> ErrorEnvelope {
    let text = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    };
    ErrorEnvelope::bare(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_envelope_round_trips() {
        let err = RemoteError::named("TypeError", "bad input").with_stack("at foo");
        assert_eq!(RemoteError::from_envelope(err.to_envelope()), err);
    }

    #[test]
    fn bare_error_becomes_message() {
        let err = RemoteError::from(ErrorEnvelope::bare("Module not loaded."));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "Module not loaded.");
        assert_eq!(err.stack, None);
    }

    #[test]
    fn message_wins_over_error() {
        let err = RemoteError::from(ErrorEnvelope {
            message: Some("primary".into()),
            error: Some("secondary".into()),
            ..ErrorEnvelope::default()
        });
        assert_eq!(err.message, "primary");
    }

    #[test]
    fn empty_envelope_is_unknown_error() {
        let err = RemoteError::from(ErrorEnvelope::default());
        assert_eq!(err.to_string(), "Error: Unknown error");
    }

    #[test]
    fn panic_payloads_become_text() {
        assert_eq!(panic_envelope(Box::new("boom")).error.as_deref(), Some("boom"));
        assert_eq!(
            panic_envelope(Box::new(String::from("owned"))).error.as_deref(),
            Some("owned")
        );
        assert_eq!(panic_envelope(Box::new(42u8)).error.as_deref(), Some("panic"));
    }
}
