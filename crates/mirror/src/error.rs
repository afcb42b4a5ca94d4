use crate::playlist::ParseError;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirroring cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid playlist: {}", format_parse_errors(.errors))]
    InvalidPlaylist { errors: Vec<ParseError> },

    #[error("request queue is closed")]
    QueueClosed,

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MirrorError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether polling again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::QueueClosed
            | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::NOT_FOUND
            }
            Self::Network { .. } | Self::Io { .. } | Self::InvalidPlaylist { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_playlist_lists_every_error() {
        let err = MirrorError::InvalidPlaylist {
            errors: vec![ParseError::MissingHeader, ParseError::NoSegments],
        };
        assert_eq!(
            err.to_string(),
            "invalid playlist: no #EXTM3U tag at the start of playlist; no items in the playlist"
        );
    }

    #[test]
    fn classifies_retryable_errors() {
        assert!(MirrorError::http_status(StatusCode::BAD_GATEWAY, "u", "playlist").is_retryable());
        assert!(!MirrorError::http_status(StatusCode::FORBIDDEN, "u", "playlist").is_retryable());
        assert!(!MirrorError::QueueClosed.is_retryable());
        assert!(MirrorError::InvalidPlaylist { errors: vec![] }.is_retryable());
    }
}
