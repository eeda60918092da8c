//! 目标路径解析：根目录约束、遍历拒绝与符号链接检查。

use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::error::GatewayError;

/// On-disk target of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    directory: PathBuf,
    filename: String,
}

impl Destination {
    fn split(root: &Path, target: &Path) -> Self {
        match (target.parent(), target.file_name()) {
            (Some(parent), Some(name)) if target != root => Self {
                directory: parent.to_path_buf(),
                filename: name.to_string_lossy().into_owned(),
            },
            _ => Self {
                directory: target.to_path_buf(),
                filename: String::new(),
            },
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> PathBuf {
        if self.filename.is_empty() {
            self.directory.clone()
        } else {
            self.directory.join(&self.filename)
        }
    }
}

/// Resolves the request target under `root`.
///
/// `explicit` wins over the URL path when it is non-empty. An absolute
/// explicit value must already lie under `root`. Every resolved path is
/// checked for `..` segments and for symlinks on existing components.
pub async fn resolve(
    root: &Path,
    request_path: &str,
    explicit: Option<&str>,
) -> Result<Destination, GatewayError> {
    let relative = match explicit.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => explicit_relative(root, value)?,
        None => percent_decode_str(request_path)
            .decode_utf8()
            .map_err(|_| GatewayError::InvalidPath)?
            .into_owned(),
    };
    let target = contain(root, &relative)?;
    ensure_no_symlink_components(root, &target).await?;
    Ok(Destination::split(root, &target))
}

fn explicit_relative(root: &Path, value: &str) -> Result<String, GatewayError> {
    let path = Path::new(value);
    if !path.is_absolute() {
        return Ok(value.to_string());
    }
    path.strip_prefix(root)
        .map(|rest| rest.to_string_lossy().into_owned())
        .map_err(|_| GatewayError::InvalidPath)
}

/// Joins `relative` onto `root`, refusing anything that could climb out.
fn contain(root: &Path, relative: &str) -> Result<PathBuf, GatewayError> {
    let mut normalized = PathBuf::new();
    let trimmed = relative.trim_start_matches(['/', '\\']);
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::InvalidPath);
            }
        }
    }
    Ok(root.join(normalized))
}

async fn ensure_no_symlink_components(root: &Path, target: &Path) -> Result<(), GatewayError> {
    let relative = target
        .strip_prefix(root)
        .map_err(|_| GatewayError::InvalidPath)?;
    let mut current = PathBuf::from(root);
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(GatewayError::InvalidPath);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(GatewayError::InvalidPath);
                }
            }
            // Nothing below a missing component can be a link.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(GatewayError::PathCheckFailed(err)),
        }
    }

    Ok(())
}
