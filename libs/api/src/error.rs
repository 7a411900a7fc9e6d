/// Category of a relay error. Every failure point maps its error to one
/// of these, and [`ErrorKind::policy`] decides what the caller does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required configuration missing or invalid.
    Config,
    /// Store dial, stream establishment or socket bind failed.
    Connection,
    /// Envelope could not be encoded: contract violation upstream.
    Serialization,
    /// Encoded envelope does not fit into one datagram.
    OversizedPayload,
    /// Datagram send failed (unreachable address etc).
    Network,
    /// Local socket read failed.
    NetworkRead,
    /// Inbound datagram is malformed or truncated.
    Decode,
    /// Write to the store stream failed.
    StreamSend,
    /// Subscribe stream broke or was closed by the store.
    StreamReceive,
    /// Broadcast did not complete within its deadline.
    Timeout,
}

/// Что делать с ошибкой: остановить процесс или пропустить одно сообщение.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Процесс не может продолжать корректно работать: shutdown + exit 1.
    Fatal,
    /// Изолированное событие на одном сообщении: log и продолжить.
    Skip,
}

impl ErrorKind {
    /// Единая таблица kind → policy. Все циклы спрашивают её,
    /// а не решают по месту.
    pub fn policy(self) -> Policy {
        match self {
            ErrorKind::Config
            | ErrorKind::Connection
            | ErrorKind::Serialization
            | ErrorKind::StreamReceive => Policy::Fatal,
            ErrorKind::OversizedPayload
            | ErrorKind::Network
            | ErrorKind::NetworkRead
            | ErrorKind::Decode
            | ErrorKind::StreamSend
            | ErrorKind::Timeout => Policy::Skip,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Connection => "connection",
            ErrorKind::Serialization => "serialization",
            ErrorKind::OversizedPayload => "oversized_payload",
            ErrorKind::Network => "network",
            ErrorKind::NetworkRead => "network_read",
            ErrorKind::Decode => "decode",
            ErrorKind::StreamSend => "stream_send",
            ErrorKind::StreamReceive => "stream_receive",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Unified error type for codecs, brokers, store clients and the relay loops.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("config: {0}")]
    Config(String),

    #[error("connection ({target}): {detail}")]
    Connection { target: String, detail: String },

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("encoded envelope is {size} bytes, limit is {limit}")]
    OversizedPayload { size: usize, limit: usize },

    #[error("network send to {target}: {detail}")]
    Network { target: String, detail: String },

    #[error("socket read: {0}")]
    NetworkRead(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("store write: {0}")]
    StreamSend(String),

    #[error("store subscription: {0}")]
    StreamReceive(String),

    #[error("broadcast timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RelayError {
    pub fn connection(target: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        RelayError::Connection { target: target.into(), detail: detail.to_string() }
    }

    pub fn network(target: impl std::fmt::Display, detail: impl std::fmt::Display) -> Self {
        RelayError::Network { target: target.to_string(), detail: detail.to_string() }
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        RelayError::Decode(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Config(_) => ErrorKind::Config,
            RelayError::Connection { .. } => ErrorKind::Connection,
            RelayError::Serialization(_) => ErrorKind::Serialization,
            RelayError::OversizedPayload { .. } => ErrorKind::OversizedPayload,
            RelayError::Network { .. } => ErrorKind::Network,
            RelayError::NetworkRead(_) => ErrorKind::NetworkRead,
            RelayError::Decode(_) => ErrorKind::Decode,
            RelayError::StreamSend(_) => ErrorKind::StreamSend,
            RelayError::StreamReceive(_) => ErrorKind::StreamReceive,
            RelayError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn policy(&self) -> Policy {
        self.kind().policy()
    }

    pub fn is_fatal(&self) -> bool {
        self.policy() == Policy::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_match_policy_table() {
        let fatal = [
            RelayError::Config("x".into()),
            RelayError::connection("localhost:6666", "refused"),
            RelayError::Serialization("x".into()),
            RelayError::StreamReceive("reset".into()),
        ];
        for e in &fatal {
            assert!(e.is_fatal(), "{e} should be fatal");
        }
    }

    #[test]
    fn per_message_kinds_are_skipped() {
        let skipped = [
            RelayError::OversizedPayload { size: 2000, limit: 1024 },
            RelayError::network("10.0.0.255:4020", "unreachable"),
            RelayError::NetworkRead("x".into()),
            RelayError::decode("truncated"),
            RelayError::StreamSend("x".into()),
            RelayError::Timeout(std::time::Duration::from_secs(2)),
        ];
        for e in &skipped {
            assert_eq!(e.policy(), Policy::Skip, "{e} should be skipped");
        }
    }

    #[test]
    fn display_includes_context() {
        let e = RelayError::OversizedPayload { size: 1500, limit: 1024 };
        assert_eq!(e.to_string(), "encoded envelope is 1500 bytes, limit is 1024");
        assert_eq!(e.kind().to_string(), "oversized_payload");
    }
}
