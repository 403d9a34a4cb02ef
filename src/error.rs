use thiserror::Error;

/// Failures a request handler can hit between admission and forwarding.
/// Each one is converted to a SIP response at the proxy boundary and
/// never propagates past the handler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("destination not registered")]
    NotRegistered,

    #[error("caller has insufficient balance")]
    InsufficientBalance,

    #[error("malformed destination: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("max-forwards exhausted")]
    TooManyHops,

    #[error("no final response before transaction timeout")]
    Timeout,
}

impl Error {
    pub fn parse<E: std::fmt::Display>(err: E) -> Self {
        Self::Parse(err.to_string())
    }

    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }

    /// The locally synthesized response for this failure.
    pub fn status_code(&self) -> rsip::StatusCode {
        match self {
            Error::NotRegistered => rsip::StatusCode::NotFound,
            Error::InsufficientBalance => rsip::StatusCode::Forbidden,
            Error::Parse(_) => rsip::StatusCode::BadGateway,
            Error::Transport(_) => rsip::StatusCode::ServiceUnavailable,
            Error::TooManyHops => rsip::StatusCode::TooManyHops,
            Error::Timeout => rsip::StatusCode::RequestTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::NotRegistered.status_code(), rsip::StatusCode::NotFound);
        assert_eq!(
            Error::InsufficientBalance.status_code(),
            rsip::StatusCode::Forbidden
        );
        assert_eq!(
            Error::parse("bad uri").status_code(),
            rsip::StatusCode::BadGateway
        );
        assert_eq!(
            Error::transport("send failed").status_code(),
            rsip::StatusCode::ServiceUnavailable
        );
        assert_eq!(Error::Timeout.status_code(), rsip::StatusCode::RequestTimeout);
    }
}
