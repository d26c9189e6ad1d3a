use std::fmt;
use std::str::FromStr;

/// Media kinds a publisher declares for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
    Dual,
}

impl StreamKind {
    pub fn has_audio(self) -> bool {
        matches!(self, StreamKind::Audio | StreamKind::Dual)
    }

    pub fn has_video(self) -> bool {
        matches!(self, StreamKind::Video | StreamKind::Dual)
    }
}

impl FromStr for StreamKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AUDIO" => Ok(StreamKind::Audio),
            "VIDEO" => Ok(StreamKind::Video),
            "DUAL" => Ok(StreamKind::Dual),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamKind::Audio => "AUDIO",
            StreamKind::Video => "VIDEO",
            StreamKind::Dual => "DUAL",
        };
        f.write_str(s)
    }
}

/// Codes carried in ERROR frames sent to signaling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequestId,
    InvalidStreamId,
    ProtocolError,
    LimitRequests,
    InvalidAuth,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequestId => "INVALID_REQUEST_ID",
            ErrorCode::InvalidStreamId => "INVALID_STREAM_ID",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::LimitRequests => "LIMIT_REQUESTS",
            ErrorCode::InvalidAuth => "INVALID_AUTH",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
