use core::error::Error;

/// Webhook service errors
#[derive(Debug, derive_more::Display)]
pub enum AdmissionError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Failed to load mappings from {path}")]
    MappingUnreadable { path: String },
    #[display("Failed to watch mappings: {message}")]
    WatchFailed { message: String },
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for AdmissionError {}
