//! 网关错误类型与状态码映射。

use axum::http::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single gateway request.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid destination path")]
    InvalidPath,
    #[error("access denied")]
    AccessDenied,
    #[error("missing file part `{0}`")]
    MissingFilePart(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("form fields exceed {limit} bytes")]
    FormTooLarge { limit: u64 },
    #[error("malformed multipart body: {0}")]
    MalformedBody(String),
    #[error("dir {} exists", .path.display())]
    AlreadyExists { path: PathBuf },
    #[error("mkdir {} error: {source}", .path.display())]
    CreateFailed { path: PathBuf, source: io::Error },
    #[error("mkdirall {} error: {source}", .path.display())]
    DirectoryCreateFailed { path: PathBuf, source: io::Error },
    #[error("backup {} error: {source}", .path.display())]
    BackupRenameFailed { path: PathBuf, source: io::Error },
    #[error("open {} error: {source}", .path.display())]
    OpenFailed { path: PathBuf, source: io::Error },
    #[error("write {} error: {source}", .path.display())]
    StreamCopyFailed { path: PathBuf, source: io::Error },
    #[error("delete {} error: {source}", .path.display())]
    DeleteFailed { path: PathBuf, source: io::Error },
    #[error("spool error: {0}")]
    SpoolFailed(io::Error),
    #[error("path check error: {0}")]
    PathCheckFailed(io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPath
            | GatewayError::MissingFilePart(_)
            | GatewayError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::AccessDenied => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge { .. } | GatewayError::FormTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            GatewayError::AlreadyExists { .. } => StatusCode::CONFLICT,
            GatewayError::CreateFailed { .. }
            | GatewayError::DirectoryCreateFailed { .. }
            | GatewayError::BackupRenameFailed { .. }
            | GatewayError::OpenFailed { .. }
            | GatewayError::StreamCopyFailed { .. }
            | GatewayError::DeleteFailed { .. }
            | GatewayError::SpoolFailed(_)
            | GatewayError::PathCheckFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Negative envelope code, distinct per failure.
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::InvalidPath => -1,
            GatewayError::AccessDenied => -2,
            GatewayError::MissingFilePart(_) => -3,
            GatewayError::PayloadTooLarge { .. } => -4,
            GatewayError::FormTooLarge { .. } => -5,
            GatewayError::MalformedBody(_) => -6,
            GatewayError::AlreadyExists { .. } => -7,
            GatewayError::CreateFailed { .. } => -20,
            GatewayError::DirectoryCreateFailed { .. } => -21,
            GatewayError::BackupRenameFailed { .. } => -22,
            GatewayError::OpenFailed { .. } => -23,
            GatewayError::StreamCopyFailed { .. } => -24,
            GatewayError::DeleteFailed { .. } => -25,
            GatewayError::SpoolFailed(_) => -26,
            GatewayError::PathCheckFailed(_) => -27,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

/// Startup failure; the gateway refuses to run with it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid size `{0}`")]
    InvalidSize(String),
    #[error("directory {} unusable: {source}", .path.display())]
    Directory { path: PathBuf, source: io::Error },
    #[error("response template {} unreadable: {source}", .path.display())]
    Template { path: PathBuf, source: io::Error },
}

impl From<ConfigError> for io::Error {
    fn from(error: ConfigError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, error.to_string())
    }
}
