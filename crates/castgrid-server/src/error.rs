use thiserror::Error;

/// Failures raised by the media plane and the wire encodings. The
/// registry never surfaces these across its interface; entities log them
/// and collapse into their close path.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("media-plane error: {0}")]
    Media(#[from] webrtc::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
