use crate::auth::AuthError;
use crate::connection_manager::ConnectionError;
use crate::membership::MembershipError;

/// Why a connection could not be set up. None of these leave state behind.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("membership unavailable: {0}")]
    MembershipUnavailable(#[from] MembershipError),

    #[error("connection setup timed out")]
    SetupTimeout,

    #[error("connection setup cancelled")]
    Cancelled,

    #[error("{0}")]
    ConnectionLimit(#[from] ConnectionError),

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Unauthorized(_) => "unauthorized",
            HubError::MembershipUnavailable(_) => "membership_unavailable",
            HubError::SetupTimeout => "setup_timeout",
            HubError::Cancelled => "cancelled",
            HubError::ConnectionLimit(_) => "connection_limit",
            HubError::ShuttingDown => "shutting_down",
        }
    }

    /// Close reason sent to the client. Never includes internal detail.
    pub fn close_reason(&self) -> &'static str {
        match self {
            HubError::Unauthorized(AuthError::Expired) => "token expired",
            HubError::Unauthorized(_) => "invalid or missing token",
            HubError::MembershipUnavailable(_) => "circle membership unavailable, retry later",
            HubError::SetupTimeout => "connection setup timed out, retry later",
            HubError::Cancelled => "connection setup cancelled",
            HubError::ConnectionLimit(ConnectionError::UserLimitExceeded { .. }) => {
                "too many connections for this user"
            }
            HubError::ConnectionLimit(_) => "server at capacity",
            HubError::ShuttingDown => "server shutting down",
        }
    }

    /// WebSocket close code (4xxx application range)
    pub fn close_code(&self) -> u16 {
        match self {
            HubError::Unauthorized(_) => 4401,
            HubError::MembershipUnavailable(_) => 4503,
            HubError::SetupTimeout => 4408,
            HubError::Cancelled => 4499,
            HubError::ConnectionLimit(_) => 4429,
            HubError::ShuttingDown => 1001,
        }
    }

    /// Whether the client may retry immediately
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HubError::Unauthorized(_))
    }
}
