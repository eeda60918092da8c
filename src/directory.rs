//! 目录创建与文件删除。

use std::path::Path;
use tokio::fs;
use tracing::info;

use crate::error::GatewayError;

/// Creates `path` and any missing parents. An existing directory is a conflict.
pub async fn create_directory(path: &Path) -> Result<(), GatewayError> {
    if let Ok(metadata) = fs::metadata(path).await
        && metadata.is_dir()
    {
        return Err(GatewayError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    fs::create_dir_all(path)
        .await
        .map_err(|source| GatewayError::CreateFailed {
            path: path.to_path_buf(),
            source,
        })?;
    info!(path = ?path, "create directory");
    Ok(())
}

/// Removes the file at `path`.
pub async fn delete_file(path: &Path) -> Result<(), GatewayError> {
    fs::remove_file(path)
        .await
        .map_err(|source| GatewayError::DeleteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    info!(path = ?path, "delete file");
    Ok(())
}
