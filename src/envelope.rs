//! 结果信封与可选的响应模板渲染。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{ConfigError, GatewayError};

/// Machine-readable outcome of one request. `code` is 0 on success.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            code: 0,
            message: None,
            data,
        }
    }

    /// Success payload of an upload: the path that was written.
    pub fn written(path: &Path) -> Self {
        Self::success(Some(json!({ "dir": path.to_string_lossy() })))
    }

    pub fn failure(error: &GatewayError) -> Self {
        Self {
            code: error.code(),
            message: Some(error.to_string()),
            data: None,
        }
    }
}

/// Body template loaded once at startup.
#[derive(Debug)]
pub struct ResponseTemplate {
    body: String,
    content_type: HeaderValue,
}

impl ResponseTemplate {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let body = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Template {
                path: PathBuf::from(path),
                source,
            })?;
        Ok(Self::new(body, path))
    }

    fn new(body: String, path: &Path) -> Self {
        let mime = mime_guess::from_path(path).first_or_text_plain();
        let content_type = HeaderValue::from_str(mime.essence_str())
            .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
        Self { body, content_type }
    }

    /// Substitutes `{{code}}`, `{{message}}`, `{{dir}}` and `{{data}}`.
    pub fn render(&self, envelope: &Envelope) -> String {
        let dir = envelope
            .data
            .as_ref()
            .and_then(|data| data.get("dir"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let data = envelope
            .data
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "null".to_string());
        self.body
            .replace("{{code}}", &envelope.code.to_string())
            .replace("{{message}}", envelope.message.as_deref().unwrap_or_default())
            .replace("{{dir}}", dir)
            .replace("{{data}}", &data)
    }
}

/// Builds the HTTP response for an envelope, through the template when one is set.
pub fn respond(
    status: StatusCode,
    envelope: Envelope,
    template: Option<&ResponseTemplate>,
) -> Response {
    match template {
        Some(template) => (
            status,
            [(header::CONTENT_TYPE, template.content_type.clone())],
            template.render(&envelope),
        )
            .into_response(),
        None => (status, JsonResponse(envelope)).into_response(),
    }
}
