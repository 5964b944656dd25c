use std::fmt;

use crate::protocol::OaiErrorCode;

/// How the harvest loop reacts to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// `noRecordsMatch`: terminal for the set, not an error.
    NoMatch,
    /// Transport-class: sleep, then ask for the same page again.
    Retry,
    /// Abort the harvest.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    InvalidUrl,
    RedirectLimitExceeded,
    HttpStatus(u16),
    Timeout,
    Network,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    Decode,
    MalformedResponse,
    Protocol(OaiErrorCode),
    MissingStructure,
    Datestamp,
    Transform,
}

impl FaultKind {
    pub fn classify(&self) -> FaultClass {
        match self {
            FaultKind::Protocol(OaiErrorCode::NoRecordsMatch) => FaultClass::NoMatch,
            FaultKind::Timeout
            | FaultKind::Network
            | FaultKind::Decode
            | FaultKind::MalformedResponse => FaultClass::Retry,
            FaultKind::HttpStatus(code) if *code >= 500 || *code == 408 || *code == 429 => {
                FaultClass::Retry
            }
            FaultKind::HttpStatus(_)
            | FaultKind::InvalidUrl
            | FaultKind::RedirectLimitExceeded
            | FaultKind::TooLarge { .. }
            | FaultKind::Protocol(_)
            | FaultKind::MissingStructure
            | FaultKind::Datestamp
            | FaultKind::Transform => FaultClass::Fatal,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::InvalidUrl => write!(f, "invalid url"),
            FaultKind::RedirectLimitExceeded => write!(f, "redirect limit exceeded"),
            FaultKind::HttpStatus(code) => write!(f, "http status {code}"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::Network => write!(f, "network error"),
            FaultKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FaultKind::Decode => write!(f, "undecodable response body"),
            FaultKind::MalformedResponse => write!(f, "malformed OAI-PMH response"),
            FaultKind::Protocol(code) => write!(f, "OAI-PMH error {}", code.as_str()),
            FaultKind::MissingStructure => write!(f, "missing required XML structure"),
            FaultKind::Datestamp => write!(f, "unparsable datestamp"),
            FaultKind::Transform => write!(f, "schema transformation failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OaiError {
    pub kind: FaultKind,
    pub message: String,
}

impl OaiError {
    pub(crate) fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn classify(&self) -> FaultClass {
        self.kind.classify()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMetadata {
    pub url: String,
    pub final_url: String,
    pub redirect_count: usize,
    pub content_type: Option<String>,
    pub byte_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutput {
    pub bytes: Vec<u8>,
    pub metadata: FetchMetadata,
}
