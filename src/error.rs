/// Errors raised by the session authenticator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The OS random source or digest primitive could not be used.
    #[error("Secure random source unavailable: {0}")]
    CryptoUnavailable(String),

    /// Callback `state` does not match the pending sign-in (possible CSRF).
    #[error("State mismatch: callback does not belong to the pending sign-in")]
    StateMismatch,

    /// Code-for-token exchange failed (network, HTTP status, or provider error).
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// An operation that needs a token was attempted without one.
    #[error("Not signed in")]
    NotSignedIn,

    /// Self-profile request failed.
    #[error("Profile request failed: {0}")]
    ProfileFetch(String),

    /// Profile is valid but its organization is not on the allow-list.
    #[error("{message}")]
    OrganizationDenied {
        organization: Option<String>,
        message: String,
    },

    /// The portal rejected the access token on an authenticated call.
    #[error("Authentication expired")]
    AuthenticationExpired,

    /// An authenticated portal call failed for a reason other than the token.
    #[error("Portal request failed: {0}")]
    Request(String),

    /// Session storage could not persist or remove a record.
    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Discriminant of [`Error`], carried in error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Config,
    CryptoUnavailable,
    StateMismatch,
    TokenExchange,
    NotSignedIn,
    ProfileFetch,
    OrganizationDenied,
    AuthenticationExpired,
    Request,
    Storage,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::CryptoUnavailable(_) => ErrorKind::CryptoUnavailable,
            Self::StateMismatch => ErrorKind::StateMismatch,
            Self::TokenExchange(_) => ErrorKind::TokenExchange,
            Self::NotSignedIn => ErrorKind::NotSignedIn,
            Self::ProfileFetch(_) => ErrorKind::ProfileFetch,
            Self::OrganizationDenied { .. } => ErrorKind::OrganizationDenied,
            Self::AuthenticationExpired => ErrorKind::AuthenticationExpired,
            Self::Request(_) => ErrorKind::Request,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Builds the denial error shown to users outside the allow-list.
    pub(crate) fn organization_denied(
        organization: Option<&str>,
        display_name: Option<&str>,
    ) -> Self {
        let message = match display_name {
            Some(name) => format!("Access denied: this tool is restricted to {name} accounts"),
            None => "Access denied: your organization is not authorized".to_string(),
        };
        Self::OrganizationDenied {
            organization: organization.map(str::to_owned),
            message,
        }
    }
}
