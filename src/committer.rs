//! 上传提交：限长接收 multipart 表单、覆盖前备份、流式写入目标文件。

use axum::http::header;
use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use multer::{Constraints, Multipart, SizeLimit};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::paths::Destination;
use crate::spool::SpooledPart;

/// Limits applied while receiving one upload.
#[derive(Clone, Debug)]
pub struct UploadLimits {
    /// Ceiling on the whole request body.
    pub max_filesize: u64,
    /// In-memory ceiling for the file part and for all text fields together.
    pub max_form_buffer: u64,
}

/// The file part of a received form.
#[derive(Debug)]
pub struct FilePart {
    pub declared_filename: String,
    /// Client-sent part length when present, else the received length. Advisory only.
    pub declared_size: u64,
    pub content: SpooledPart,
}

/// A fully received multipart body.
#[derive(Debug)]
pub struct UploadForm {
    pub fields: HashMap<String, String>,
    pub file: Option<FilePart>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn take_file(&mut self, field_name: &str) -> Result<FilePart, GatewayError> {
        self.file
            .take()
            .ok_or_else(|| GatewayError::MissingFilePart(field_name.to_string()))
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub declared_filename: String,
    pub declared_size: u64,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct UploadCommitter {
    limits: UploadLimits,
    spool_dir: PathBuf,
}

impl UploadCommitter {
    pub fn new(limits: UploadLimits, spool_dir: PathBuf) -> Self {
        Self { limits, spool_dir }
    }

    /// Reads the whole multipart body, keeping the first part named `file_field`.
    ///
    /// Nothing under the destination tree is touched here, so a body that is
    /// too large or cut short leaves the target as it was.
    pub async fn receive<S, E>(
        &self,
        stream: S,
        boundary: &str,
        file_field: &str,
    ) -> Result<UploadForm, GatewayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let constraints = Constraints::new()
            .size_limit(SizeLimit::new().whole_stream(self.limits.max_filesize));
        let mut multipart = Multipart::with_constraints(stream, boundary, constraints);
        let mut fields = HashMap::new();
        let mut file: Option<FilePart> = None;
        let mut field_bytes: u64 = 0;

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|err| self.multipart_error(err))?
        {
            let name = field.name().unwrap_or_default().to_string();

            if name == file_field && file.is_none() {
                let declared_filename = field.file_name().unwrap_or_default().to_string();
                let declared_len = field
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok());
                let mut content = SpooledPart::new(&self.spool_dir, self.limits.max_form_buffer);
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| self.multipart_error(err))?
                {
                    content
                        .write(&chunk)
                        .await
                        .map_err(GatewayError::SpoolFailed)?;
                }
                debug!(
                    field = name,
                    filename = declared_filename,
                    bytes = content.len(),
                    spilled = content.is_spilled(),
                    "received file part"
                );
                file = Some(FilePart {
                    declared_filename,
                    declared_size: declared_len.unwrap_or(content.len()),
                    content,
                });
                continue;
            }

            if field.file_name().is_some() || name == file_field {
                while field
                    .chunk()
                    .await
                    .map_err(|err| self.multipart_error(err))?
                    .is_some()
                {}
                continue;
            }

            let mut value = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|err| self.multipart_error(err))?
            {
                field_bytes += chunk.len() as u64;
                if field_bytes > self.limits.max_form_buffer {
                    return Err(GatewayError::FormTooLarge {
                        limit: self.limits.max_form_buffer,
                    });
                }
                value.extend_from_slice(&chunk);
            }
            fields
                .entry(name)
                .or_insert_with(|| String::from_utf8_lossy(&value).into_owned());
        }

        Ok(UploadForm { fields, file })
    }

    fn multipart_error(&self, err: multer::Error) -> GatewayError {
        match err {
            multer::Error::StreamSizeExceeded { .. } | multer::Error::FieldSizeExceeded { .. } => {
                GatewayError::PayloadTooLarge {
                    limit: self.limits.max_filesize,
                }
            }
            other => GatewayError::MalformedBody(other.to_string()),
        }
    }

    /// Writes `part` to `destination`, moving a non-empty existing file aside first.
    pub async fn commit(
        &self,
        part: FilePart,
        destination: &Destination,
    ) -> Result<CommitReport, GatewayError> {
        if destination.filename().is_empty() {
            return Err(GatewayError::InvalidPath);
        }
        let directory = destination.directory();
        fs::create_dir_all(directory)
            .await
            .map_err(|source| GatewayError::DirectoryCreateFailed {
                path: directory.to_path_buf(),
                source,
            })?;

        let target = destination.path();
        let backup = backup_existing(destination, &target).await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .await
            .map_err(|source| GatewayError::OpenFailed {
                path: target.clone(),
                source,
            })?;
        let copy_failed = |source| GatewayError::StreamCopyFailed {
            path: target.clone(),
            source,
        };
        let mut reader = part
            .content
            .into_reader()
            .await
            .map_err(GatewayError::SpoolFailed)?;
        // A failure past this point leaves whatever was written in place.
        let bytes_written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(copy_failed)?;
        file.flush().await.map_err(copy_failed)?;
        file.sync_all().await.map_err(copy_failed)?;

        info!(
            path = ?target,
            bytes_written,
            filename = part.declared_filename,
            declared_size = part.declared_size,
            backup = ?backup,
            "upload committed"
        );
        Ok(CommitReport {
            path: target,
            bytes_written,
            declared_filename: part.declared_filename,
            declared_size: part.declared_size,
            backup,
        })
    }
}

/// Name a pre-existing file is moved to before being overwritten.
pub fn backup_file_name(filename: &str, unix_secs: i64) -> String {
    format!("backup-{unix_secs}.{filename}")
}

async fn backup_existing(
    destination: &Destination,
    target: &Path,
) -> Result<Option<PathBuf>, GatewayError> {
    let metadata = match fs::metadata(target).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(GatewayError::PathCheckFailed(err)),
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return Ok(None);
    }

    let backup = destination.directory().join(backup_file_name(
        destination.filename(),
        Utc::now().timestamp(),
    ));
    fs::rename(target, &backup)
        .await
        .map_err(|source| GatewayError::BackupRenameFailed {
            path: target.to_path_buf(),
            source,
        })?;
    info!(from = ?target, to = ?backup, previous_size = metadata.len(), "backed up existing file");
    Ok(Some(backup))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;
    use tempfile::tempdir;

    use crate::paths;

    pub(crate) const BOUNDARY: &str = "X-UPLOAD2DIR-BOUNDARY";

    /// Builds a multipart body with text fields followed by one file part.
    pub(crate) fn multipart_body(
        fields: &[(&str, &str)],
        file: Option<(&str, &str, &[u8])>,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((name, filename, content)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn body_stream(
        body: Vec<u8>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .chunks(7)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        stream::iter(chunks)
    }

    fn committer(spool: &Path, max_filesize: u64, max_form_buffer: u64) -> UploadCommitter {
        UploadCommitter::new(
            UploadLimits {
                max_filesize,
                max_form_buffer,
            },
            spool.to_path_buf(),
        )
    }

    fn make_dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("data");
        let spool = temp.path().join("spool");
        std::fs::create_dir_all(&root).expect("create root");
        std::fs::create_dir_all(&spool).expect("create spool");
        let root = std::fs::canonicalize(root).expect("canonical root");
        (temp, root, spool)
    }

    #[tokio::test]
    async fn receive_collects_fields_and_file() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 10_000, 10_000);
        let body = multipart_body(
            &[("dest", "inbox/a.txt")],
            Some(("file", "a.txt", b"payload")),
        );
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");

        assert_eq!(form.field("dest"), Some("inbox/a.txt"));
        let part = form.take_file("file").expect("file part");
        assert_eq!(part.declared_filename, "a.txt");
        assert_eq!(part.declared_size, 7);
    }

    #[tokio::test]
    async fn receive_without_file_part_reports_missing() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 10_000, 10_000);
        let body = multipart_body(&[("note", "hi")], Some(("other", "x.bin", b"zz")));
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        assert!(matches!(
            form.take_file("file"),
            Err(GatewayError::MissingFilePart(name)) if name == "file"
        ));
    }

    #[tokio::test]
    async fn oversized_body_is_payload_too_large() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 1000, 10_000);
        let content = vec![b'a'; 2000];
        let body = multipart_body(&[], Some(("file", "big.bin", &content)));
        let result = committer.receive(body_stream(body), BOUNDARY, "file").await;
        assert!(matches!(
            result,
            Err(GatewayError::PayloadTooLarge { limit: 1000 })
        ));
        assert_eq!(std::fs::read_dir(&spool).expect("list").count(), 0);
    }

    #[tokio::test]
    async fn oversized_text_fields_are_rejected() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 10_000, 8);
        let body = multipart_body(&[("note", "far too long for the buffer")], None);
        let result = committer.receive(body_stream(body), BOUNDARY, "file").await;
        assert!(matches!(result, Err(GatewayError::FormTooLarge { limit: 8 })));
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 10_000, 10_000);
        let mut body = multipart_body(&[], Some(("file", "a.txt", b"payload")));
        body.truncate(body.len() / 2);
        let result = committer.receive(body_stream(body), BOUNDARY, "file").await;
        assert!(matches!(result, Err(GatewayError::MalformedBody(_))));
    }

    #[tokio::test]
    async fn commit_round_trips_bytes_and_creates_directories() {
        let (_temp, root, spool) = make_dirs();
        let committer = committer(&spool, 1_000_000, 16);
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let body = multipart_body(&[], Some(("file", "blob.bin", &content)));
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        let dest = paths::resolve(&root, "/nested/deeper/blob.bin", None)
            .await
            .expect("resolve");

        let report = committer
            .commit(form.take_file("file").expect("part"), &dest)
            .await
            .expect("commit");
        assert_eq!(report.bytes_written, 5000);
        assert!(report.backup.is_none());
        let written = std::fs::read(root.join("nested/deeper/blob.bin")).expect("read");
        assert_eq!(written, content);
        assert_eq!(std::fs::read_dir(&spool).expect("list").count(), 0);
    }

    #[tokio::test]
    async fn commit_backs_up_existing_file() {
        let (_temp, root, spool) = make_dirs();
        let committer = committer(&spool, 1_000_000, 1_000_000);
        let original = vec![b'o'; 50];
        std::fs::write(root.join("report.txt"), &original).expect("seed");

        let body = multipart_body(&[], Some(("file", "report.txt", b"0123456789")));
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        let dest = paths::resolve(&root, "/report.txt", None)
            .await
            .expect("resolve");
        let before = Utc::now().timestamp();
        let report = committer
            .commit(form.take_file("file").expect("part"), &dest)
            .await
            .expect("commit");
        let after = Utc::now().timestamp();

        assert_eq!(std::fs::read(root.join("report.txt")).expect("read"), b"0123456789");
        let backups: Vec<String> = std::fs::read_dir(&root)
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("backup-"))
            .collect();
        assert_eq!(backups.len(), 1);
        let stamp: i64 = backups[0]
            .strip_prefix("backup-")
            .and_then(|rest| rest.strip_suffix(".report.txt"))
            .and_then(|stamp| stamp.parse().ok())
            .expect("timestamped backup name");
        assert!((before..=after).contains(&stamp));
        assert_eq!(report.backup, Some(root.join(&backups[0])));
        assert_eq!(std::fs::read(root.join(&backups[0])).expect("read backup"), original);
    }

    #[tokio::test]
    async fn empty_existing_file_is_overwritten_without_backup() {
        let (_temp, root, spool) = make_dirs();
        let committer = committer(&spool, 1_000_000, 1_000_000);
        std::fs::write(root.join("empty.txt"), b"").expect("seed");

        let body = multipart_body(&[], Some(("file", "empty.txt", b"new")));
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        let dest = paths::resolve(&root, "/empty.txt", None).await.expect("resolve");
        let report = committer
            .commit(form.take_file("file").expect("part"), &dest)
            .await
            .expect("commit");

        assert!(report.backup.is_none());
        assert_eq!(std::fs::read(root.join("empty.txt")).expect("read"), b"new");
        assert_eq!(std::fs::read_dir(&root).expect("list").count(), 1);
    }

    #[tokio::test]
    async fn failed_backup_rename_leaves_original_untouched() {
        let (_temp, root, spool) = make_dirs();
        let committer = committer(&spool, 1_000_000, 1_000_000);
        std::fs::write(root.join("keep.txt"), b"precious").expect("seed");
        // A non-empty directory squatting on every backup name the commit could pick.
        let now = Utc::now().timestamp();
        for secs in now..=now + 5 {
            let squatter = root.join(backup_file_name("keep.txt", secs));
            std::fs::create_dir_all(&squatter).expect("create squatter");
            std::fs::write(squatter.join("occupied"), b"x").expect("fill squatter");
        }

        let body = multipart_body(&[], Some(("file", "keep.txt", b"replacement")));
        let mut form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        let dest = paths::resolve(&root, "/keep.txt", None)
            .await
            .expect("resolve");
        let result = committer
            .commit(form.take_file("file").expect("part"), &dest)
            .await;

        assert!(matches!(result, Err(GatewayError::BackupRenameFailed { .. })));
        assert_eq!(std::fs::read(root.join("keep.txt")).expect("read"), b"precious");
        assert_eq!(std::fs::read_dir(&root).expect("list").count(), 7);
    }

    #[tokio::test]
    async fn repeated_text_field_keeps_first_value() {
        let (_temp, _root, spool) = make_dirs();
        let committer = committer(&spool, 10_000, 10_000);
        let body = multipart_body(
            &[("dest", "first/a.txt"), ("dest", "second/a.txt")],
            Some(("file", "a.txt", b"x")),
        );
        let form = committer
            .receive(body_stream(body), BOUNDARY, "file")
            .await
            .expect("receive");
        assert_eq!(form.field("dest"), Some("first/a.txt"));
    }

    #[test]
    fn backup_name_embeds_timestamp_and_filename() {
        assert_eq!(
            backup_file_name("report.txt", 1_700_000_000),
            "backup-1700000000.report.txt"
        );
    }
}
