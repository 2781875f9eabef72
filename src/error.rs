use http::Method;
use thiserror::Error as ThisError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidConfig,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeQuery,
    Deserialize,
    Transport,
    HttpStatus,
    CircuitOpen,
    PluginAbort,
    Plugin,
    PluginRegistration,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidConfig => "invalid_config",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::Deserialize => "deserialize",
            Self::Transport => "transport",
            Self::HttpStatus => "http_status",
            Self::CircuitOpen => "circuit_open",
            Self::PluginAbort => "plugin_abort",
            Self::Plugin => "plugin",
            Self::PluginRegistration => "plugin_registration",
        }
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfig {
        field: &'static str,
        message: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("circuit breaker is open for host {host} ({method} {uri}); retry after {retry_after_ms}ms")]
    CircuitOpen {
        host: String,
        method: Method,
        uri: String,
        retry_after_ms: u128,
    },
    #[error("plugin {plugin} aborted {method} {uri}: {source}")]
    PluginAbort {
        plugin: String,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },
    #[error("failed to register plugin {plugin}: {message}")]
    PluginRegistration { plugin: String, message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::PluginAbort { .. } => ErrorCode::PluginAbort,
            Self::Plugin { .. } => ErrorCode::Plugin,
            Self::PluginRegistration { .. } => ErrorCode::PluginRegistration,
        }
    }

    pub fn transport_error_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{Error, ErrorCode, TransportErrorKind};

    #[test]
    fn error_codes_are_stable_strings() {
        let error = Error::CircuitOpen {
            host: "api.example.com".to_owned(),
            method: Method::GET,
            uri: "https://api.example.com/v1".to_owned(),
            retry_after_ms: 1500,
        };
        assert_eq!(error.code(), ErrorCode::CircuitOpen);
        assert_eq!(error.code().as_str(), "circuit_open");
        assert!(error.to_string().contains("retry after 1500ms"));
    }

    #[test]
    fn transport_error_exposes_kind() {
        let error = Error::Transport {
            kind: TransportErrorKind::Timeout,
            method: Method::GET,
            uri: "https://api.example.com".to_owned(),
            source: "deadline elapsed".into(),
        };
        assert_eq!(error.transport_error_kind(), Some(TransportErrorKind::Timeout));
        assert_eq!(error.status(), None);
        assert!(error.to_string().contains("(timeout)"));
    }
}
