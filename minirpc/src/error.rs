use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    InvalidArgument,
    SerdeJsonError,
    TcpConnectFailed,
    TcpBindFailed,
    TcpSendMsgFailed,
    TcpRecvMsgFailed,
    TcpParseMsgFailed,
    EndOfStream,
    HttpBuildReqFailed,
    HttpSendReqFailed,
    HttpWaitRspFailed,
    HttpStatus(u16),
    NoAvailableServers,
    MethodNotFound,
    ArgumentMismatch,
    MethodFailed,
    RemoteError,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Whether the failure happened below the RPC envelope (connect, send,
    /// receive or framing) rather than inside the remote method.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout
                | ErrorKind::TcpConnectFailed
                | ErrorKind::TcpSendMsgFailed
                | ErrorKind::TcpRecvMsgFailed
                | ErrorKind::TcpParseMsgFailed
                | ErrorKind::EndOfStream
        )
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            msg: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeJsonError,
            msg: value.to_string(),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(value: std::string::FromUtf8Error) -> Self {
        Self {
            kind: ErrorKind::TcpParseMsgFailed,
            msg: value.to_string(),
        }
    }
}

impl From<hyper::http::Error> for Error {
    fn from(value: hyper::http::Error) -> Self {
        Self {
            kind: ErrorKind::HttpBuildReqFailed,
            msg: value.to_string(),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(value: hyper::Error) -> Self {
        Self {
            kind: ErrorKind::HttpSendReqFailed,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let kind = ErrorKind::Timeout;
        let error: Error = kind.into();
        assert_eq!(error.to_string(), "Timeout");
        assert!(error.is_transport());

        let error = Error::new(ErrorKind::TcpConnectFailed, "connection refused".into());
        assert_eq!(error.to_string(), "TcpConnectFailed: connection refused");

        let error: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(error.kind, ErrorKind::SerdeJsonError);
        assert!(!error.is_transport());
    }

    #[test]
    fn test_error_serde() {
        let error = Error::new(ErrorKind::HttpStatus(404), "Not Found".into());
        let json = serde_json::to_string(&error).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
    }
}
