use aes::cipher::block_padding::UnpadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DestreamError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("No valid session found, please login again")]
    NoSession,

    #[error("Unable to get video GUID from URL: {0}")]
    InvalidVideoUrl(String),

    #[error("Invalid video metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid m3u8 file: {0}")]
    ManifestParse(String),

    #[error("No valid rendition found in master playlist")]
    NoRenditions,

    #[error("Rendition index {index} out of range ({count} available)")]
    RenditionOutOfRange { index: usize, count: usize },

    #[error("Could not extract the encryption info from the playlist")]
    NoEncryptionInfo,

    #[error("Unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid AES-128 key: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid IV: {0}")]
    InvalidIv(String),

    #[error("Encrypted stream is not aligned to the cipher block size")]
    TruncatedCiphertext,

    #[error("Pkcs7 unpad error")]
    UnpadError(#[from] UnpadError),

    #[error("aria2c is missing! It is required to download videos: {0}")]
    MissingDaemon(which::Error),

    #[error("FFmpeg is missing! It is required to merge videos: {0}")]
    MissingMuxer(which::Error),

    #[error("Could not connect to aria2c JSON-RPC WebSocket after {attempts} attempts")]
    NoConnect { attempts: u32 },

    #[error("The aria2c RPC server exited unexpectedly with code {code:?}")]
    DaemonCrashed { code: Option<i32> },

    #[error("aria2c did not shut down in time")]
    ShutdownTimeout,

    #[error("The control channel to aria2c was closed")]
    ChannelClosed,

    #[error("{failed} of {total} segments failed to download")]
    PartialDownload { failed: usize, total: usize },

    #[error("FFmpeg exited with code {code:?}")]
    MuxerFailed { code: Option<i32> },

    #[error("Interrupted by user")]
    Interrupted,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
}

impl DestreamError {
    /// Stable process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            DestreamError::MissingMuxer(_) => 10,
            DestreamError::MissingDaemon(_) => 11,
            DestreamError::NoConnect { .. } => 12,
            DestreamError::DaemonCrashed { .. } => 13,
            DestreamError::NoSession => 14,
            DestreamError::NoEncryptionInfo => 15,
            DestreamError::NoRenditions => 16,
            DestreamError::MuxerFailed { .. } => 17,
            DestreamError::PartialDownload { .. } => 18,
            DestreamError::InvalidVideoUrl(_) => 19,
            DestreamError::ManifestParse(_) => 20,
            DestreamError::ShutdownTimeout => 21,
            DestreamError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Fatal errors abort the whole run; everything else only skips the current video.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DestreamError::MissingDaemon(_)
                | DestreamError::MissingMuxer(_)
                | DestreamError::NoConnect { .. }
                | DestreamError::DaemonCrashed { .. }
                | DestreamError::ChannelClosed
                | DestreamError::ShutdownTimeout
                | DestreamError::NoSession
                | DestreamError::ManifestParse(_)
                | DestreamError::NoRenditions
                | DestreamError::Interrupted
        )
    }
}

pub type DestreamResult<T> = Result<T, DestreamError>;
