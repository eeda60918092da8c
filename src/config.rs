//! CLI arguments, size parsing and the immutable gateway configuration.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::build;
use crate::envelope::ResponseTemplate;
use crate::error::ConfigError;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_FILE_SERVER_ROOT: &str = "./data";
pub const DEFAULT_FILE_FIELD_NAME: &str = "file";
pub const DEFAULT_MAX_FILESIZE: &str = "1GB";
pub const DEFAULT_MAX_FORM_BUFFER: &str = "1GB";
pub const DEFAULT_TOKEN_COOKIE_KEY: &str = "upload2dir-token";
pub const DEFAULT_SPOOL_TTL_SECS: u64 = 24 * 60 * 60;
pub const SPOOL_CLEAN_INTERVAL_SECS: u64 = 900;
pub const SPOOL_DIR_NAME: &str = "upload2dir";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Enabled whenever at least one user line is configured.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug)]
#[command(name = "upload2dir", version = VERSION_INFO, about = "upload2dir file-write gateway")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "UPLOAD2DIR_ROOT",
        default_value = DEFAULT_FILE_SERVER_ROOT,
        help = "Root directory that uploads are written under"
    )]
    pub file_server_root: String,
    #[arg(
        long,
        env = "UPLOAD2DIR_DEST_FIELD",
        help = "Form field or query parameter carrying an explicit destination"
    )]
    pub dest_field: Option<String>,
    #[arg(
        long,
        env = "UPLOAD2DIR_FILE_FIELD",
        default_value = DEFAULT_FILE_FIELD_NAME,
        help = "Multipart field name holding the uploaded file"
    )]
    pub file_field_name: String,
    #[arg(
        long,
        env = "UPLOAD2DIR_MAX_FILESIZE",
        default_value = DEFAULT_MAX_FILESIZE,
        help = "Max request body size, e.g. 1GB, 500MiB or 1000"
    )]
    pub max_filesize: String,
    #[arg(
        long,
        env = "UPLOAD2DIR_MAX_FORM_BUFFER",
        default_value = DEFAULT_MAX_FORM_BUFFER,
        help = "Max multipart bytes buffered in memory before spilling to disk"
    )]
    pub max_form_buffer: String,
    #[arg(
        long,
        env = "UPLOAD2DIR_RESPONSE_TEMPLATE",
        help = "Template file rendered as the response body"
    )]
    pub response_template: Option<PathBuf>,
    #[arg(
        long,
        env = "UPLOAD2DIR_TOKEN_COOKIE",
        default_value = DEFAULT_TOKEN_COOKIE_KEY,
        help = "Cookie carrying the user token"
    )]
    pub user_token_cookie_key: String,
    #[arg(
        short = 'u',
        long = "user",
        env = "UPLOAD2DIR_USERS",
        value_delimiter = ',',
        help = "User line token:name:verb/verb (verbs: create_dir, delete_file, put_file)"
    )]
    pub users: Vec<String>,
    #[arg(
        long,
        env = "UPLOAD2DIR_AUTH_MODE",
        value_enum,
        default_value_t = AuthMode::Auto,
        help = "Authorization mode"
    )]
    pub auth_mode: AuthMode,
    #[arg(
        long,
        env = "UPLOAD2DIR_SPOOL_DIR",
        help = "Directory for spilled upload parts (defaults to the system temp dir)"
    )]
    pub spool_dir: Option<PathBuf>,
    #[arg(
        long,
        env = "UPLOAD2DIR_SPOOL_TTL_SECS",
        default_value_t = DEFAULT_SPOOL_TTL_SECS,
        help = "Age after which leftover spool files are removed (0 to disable)"
    )]
    pub spool_ttl_secs: u64,
    #[arg(
        short = 'b',
        long,
        env = "UPLOAD2DIR_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "UPLOAD2DIR_PORT",
        default_value_t = 5080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "UPLOAD2DIR_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
}

/// Settings read by every request. Built once, never mutated.
#[derive(Debug)]
pub struct GatewayConfig {
    pub root: PathBuf,
    pub dest_field: Option<String>,
    pub file_field_name: String,
    pub max_filesize: u64,
    pub max_form_buffer: u64,
    pub response_template: Option<ResponseTemplate>,
    pub token_cookie_key: String,
    pub spool_dir: PathBuf,
    pub spool_ttl: Duration,
}

impl GatewayConfig {
    /// Resolves sizes, prepares the root and spool directories and loads the template.
    pub async fn load(args: &Args) -> Result<Self, ConfigError> {
        let max_filesize = parse_size(&args.max_filesize)?;
        let max_form_buffer = parse_size(&args.max_form_buffer)?;
        let root = prepare_dir(Path::new(&args.file_server_root)).await?;
        let spool_dir = match &args.spool_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(SPOOL_DIR_NAME),
        };
        let spool_dir = prepare_dir(&spool_dir).await?;
        let response_template = match &args.response_template {
            Some(path) => Some(ResponseTemplate::load(path).await?),
            None => None,
        };

        Ok(Self {
            root,
            dest_field: args
                .dest_field
                .clone()
                .filter(|field| !field.trim().is_empty()),
            file_field_name: args.file_field_name.clone(),
            max_filesize,
            max_form_buffer,
            response_template,
            token_cookie_key: args.user_token_cookie_key.clone(),
            spool_dir,
            spool_ttl: Duration::from_secs(args.spool_ttl_secs),
        })
    }
}

async fn prepare_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| ConfigError::Directory {
            path: path.to_path_buf(),
            source,
        })?;
    fs::canonicalize(path)
        .await
        .map_err(|source| ConfigError::Directory {
            path: path.to_path_buf(),
            source,
        })
}

/// Parses a human-readable size into bytes.
///
/// SI suffixes are decimal (`1GB` is 1,000,000,000 bytes), IEC suffixes are
/// binary (`1GiB` is 1,073,741,824 bytes) and a bare number is bytes.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    let invalid = || ConfigError::InvalidSize(input.to_string());
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "p" | "pb" => 1_000_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        "pi" | "pib" => 1 << 50,
        _ => return Err(invalid()),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_size_uses_decimal_si_units() {
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1 gb").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("250kB").unwrap(), 250_000);
        assert_eq!(parse_size("1.5MB").unwrap(), 1_500_000);
    }

    #[test]
    fn parse_size_uses_binary_iec_units() {
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("2MiB").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn parse_size_accepts_plain_bytes() {
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size(" 42B ").unwrap(), 42);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        for value in ["", "abc", "GB", "10XB", "1.2.3MB", "99999999999999PB"] {
            assert!(
                matches!(parse_size(value), Err(ConfigError::InvalidSize(_))),
                "{value} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn load_rejects_malformed_size() {
        let temp = tempdir().expect("tempdir");
        let args = Args::parse_from([
            "upload2dir",
            "--file-server-root",
            temp.path().join("root").to_str().expect("utf8 path"),
            "--max-filesize",
            "lots",
        ]);
        let result = GatewayConfig::load(&args).await;
        assert!(matches!(result, Err(ConfigError::InvalidSize(_))));
    }

    #[tokio::test]
    async fn load_applies_defaults_and_canonical_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let args = Args::parse_from([
            "upload2dir",
            "--file-server-root",
            root.to_str().expect("utf8 path"),
            "--spool-dir",
            temp.path().join("spool").to_str().expect("utf8 path"),
        ]);
        let config = GatewayConfig::load(&args).await.expect("load config");

        assert_eq!(config.root, std::fs::canonicalize(&root).expect("canonical"));
        assert_eq!(config.file_field_name, "file");
        assert_eq!(config.max_filesize, 1_000_000_000);
        assert_eq!(config.max_form_buffer, 1_000_000_000);
        assert_eq!(config.token_cookie_key, "upload2dir-token");
        assert!(config.dest_field.is_none());
        assert!(config.response_template.is_none());
    }
}
