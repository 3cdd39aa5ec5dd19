use std::time::Duration;

use thiserror::Error;

/// Failures while turning a gateway response body into a JSON tree.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not shaped like `<callback>(<payload>)`.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// The envelope was intact but its content is not valid JSON.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// Valid JSON, but not the structure the command answers with.
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}

/// Every failure the bridge core can surface.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// DNS, connect, or connection-reset failure.
    #[error("gateway unreachable: {0}")]
    NetworkUnreachable(#[source] reqwest::Error),

    #[error("request timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("gateway answered HTTP {status}")]
    HttpStatus { status: u16 },

    /// The gateway answered with its `{"error": <code>}` object.
    #[error("gateway reported error code {code}")]
    Gateway { code: i64 },

    // ── Commands ────────────────────────────────────────────────────
    /// Out-of-range value, read-only target, or malformed device id.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    // ── Lifecycle ───────────────────────────────────────────────────
    /// The configured address does not answer like an XS1 gateway.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client setup failed: {0}")]
    ClientSetup(#[source] reqwest::Error),

    #[error("engine is not running")]
    NotRunning,
}

impl Error {
    /// Returns `true` if this error means the gateway could not be reached
    /// or did not answer sensibly. These drive connection-state transitions;
    /// everything else is local to a single command.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable(_)
                | Self::Timeout { .. }
                | Self::Parse(_)
                | Self::HttpStatus { .. }
                | Self::Gateway { .. }
                | Self::HandshakeRejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_failures() {
        assert!(Error::Timeout { timeout: Duration::from_secs(1) }.is_connection_failure());
        assert!(Error::HttpStatus { status: 502 }.is_connection_failure());
        assert!(Error::Parse(ParseError::MalformedEnvelope).is_connection_failure());
        assert!(!Error::Validation("too big".into()).is_connection_failure());
        assert!(!Error::UnknownDevice("Actuators.X.state".into()).is_connection_failure());
        assert!(!Error::NotRunning.is_connection_failure());
    }

    #[test]
    fn timeout_message_uses_milliseconds() {
        let err = Error::Timeout { timeout: Duration::from_millis(1500) };
        assert_eq!(err.to_string(), "request timed out after 1500ms");
    }
}
