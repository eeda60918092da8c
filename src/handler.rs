//! 请求分派中间件：按方法选择操作、授权、执行并返回结果信封。

use axum::body::Body as AxumBody;
use axum::extract::{Query, Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::Response;
use axum::{Router, middleware};
use axum_extra::extract::CookieJar;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::auth::{Action, Authorizer};
use crate::committer::{UploadCommitter, UploadLimits};
use crate::config::GatewayConfig;
use crate::directory;
use crate::envelope::{self, Envelope};
use crate::error::GatewayError;
use crate::http::RequestContext;
use crate::paths::{self, Destination};

/// What a request asks the gateway to do, chosen once from its method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    CreateDirectory,
    DeleteFile,
    PutFile,
    PassThrough,
}

impl Operation {
    pub fn from_method(method: &Method) -> Self {
        match *method {
            Method::PUT => Operation::PutFile,
            Method::DELETE => Operation::DeleteFile,
            Method::POST => Operation::CreateDirectory,
            _ => Operation::PassThrough,
        }
    }

    pub fn action(self) -> Option<Action> {
        match self {
            Operation::CreateDirectory => Some(Action::CreateDir),
            Operation::DeleteFile => Some(Action::DeleteFile),
            Operation::PutFile => Some(Action::PutFile),
            Operation::PassThrough => None,
        }
    }
}

/// Upload metadata published to downstream stages
/// (`upload.filename`, `upload.filesize`, `upload.max_filesize`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadVars {
    pub filename: Option<String>,
    pub filesize: Option<u64>,
    pub max_filesize: u64,
}

/// Shared, read-only state of the gateway.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    authorizer: Authorizer,
    committer: UploadCommitter,
}

struct Outcome {
    status: StatusCode,
    envelope: Envelope,
    vars: Option<UploadVars>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, authorizer: Authorizer) -> Self {
        let committer = UploadCommitter::new(
            UploadLimits {
                max_filesize: config.max_filesize,
                max_form_buffer: config.max_form_buffer,
            },
            config.spool_dir.clone(),
        );
        Self {
            config,
            authorizer,
            committer,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn execute(
        &self,
        action: Action,
        token: Option<&str>,
        parts: &Parts,
        body: AxumBody,
        ctx: &RequestContext,
    ) -> Outcome {
        let mut vars = match action {
            Action::PutFile => Some(UploadVars {
                filename: None,
                filesize: None,
                max_filesize: self.config.max_filesize,
            }),
            Action::CreateDir | Action::DeleteFile => None,
        };

        let result = match self.authorizer.authorize(token, action) {
            Ok(identity) => {
                let user = identity.name();
                match action {
                    Action::CreateDir => self.create_dir(parts, body, ctx, user).await,
                    Action::DeleteFile => self.delete_file(parts, body, ctx, user).await,
                    Action::PutFile => self.put_file(parts, body, ctx, user, &mut vars).await,
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(envelope) => Outcome {
                status: StatusCode::OK,
                envelope,
                vars,
            },
            Err(err) => {
                if err.is_client_error() {
                    warn!(
                        request_id = ctx.request_id,
                        method = ctx.method,
                        path = ctx.path,
                        client_ip = ctx.client_ip,
                        action = %action,
                        error = %err,
                        "request rejected"
                    );
                } else {
                    error!(
                        request_id = ctx.request_id,
                        method = ctx.method,
                        path = ctx.path,
                        client_ip = ctx.client_ip,
                        action = %action,
                        error = %err,
                        "request failed"
                    );
                }
                Outcome {
                    status: err.status(),
                    envelope: Envelope::failure(&err),
                    vars,
                }
            }
        }
    }

    async fn create_dir(
        &self,
        parts: &Parts,
        body: AxumBody,
        ctx: &RequestContext,
        user: &str,
    ) -> Result<Envelope, GatewayError> {
        let explicit = match self.body_destination(parts, body).await? {
            Some(value) => Some(value),
            None => self.query_destination(&parts.uri),
        };
        let dest = self.resolve(parts, explicit.as_deref()).await?;
        directory::create_directory(&dest.path()).await?;
        info!(request_id = ctx.request_id, user, path = ?dest.path(), "directory created");
        Ok(Envelope::success(None))
    }

    async fn delete_file(
        &self,
        parts: &Parts,
        body: AxumBody,
        ctx: &RequestContext,
        user: &str,
    ) -> Result<Envelope, GatewayError> {
        let explicit = match self.body_destination(parts, body).await? {
            Some(value) => Some(value),
            None => self.query_destination(&parts.uri),
        };
        let dest = self.resolve(parts, explicit.as_deref()).await?;
        directory::delete_file(&dest.path()).await?;
        info!(request_id = ctx.request_id, user, path = ?dest.path(), "file deleted");
        Ok(Envelope::success(None))
    }

    async fn put_file(
        &self,
        parts: &Parts,
        body: AxumBody,
        ctx: &RequestContext,
        user: &str,
        vars: &mut Option<UploadVars>,
    ) -> Result<Envelope, GatewayError> {
        let boundary = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| multer::parse_boundary(value).ok())
            .ok_or_else(|| GatewayError::MalformedBody("expected multipart/form-data".into()))?;
        let file_field = &self.config.file_field_name;
        let mut form = self
            .committer
            .receive(body.into_data_stream(), &boundary, file_field)
            .await?;
        let part = form.take_file(file_field)?;

        let explicit = self
            .config
            .dest_field
            .as_deref()
            .and_then(|field| form.field(field))
            .map(str::to_string)
            .or_else(|| self.query_destination(&parts.uri));
        let dest = self.resolve(parts, explicit.as_deref()).await?;
        let report = self.committer.commit(part, &dest).await?;

        info!(
            request_id = ctx.request_id,
            client_ip = ctx.client_ip,
            user,
            uploaded_file = report.declared_filename,
            file_size = report.declared_size,
            written_bytes = report.bytes_written,
            "successful upload"
        );
        if let Some(vars) = vars.as_mut() {
            vars.filename = Some(report.declared_filename.clone());
            vars.filesize = Some(report.declared_size);
        }
        Ok(Envelope::written(&report.path))
    }

    /// Reads `dest_field` from a urlencoded or multipart body, if one was sent.
    async fn body_destination(
        &self,
        parts: &Parts,
        body: AxumBody,
    ) -> Result<Option<String>, GatewayError> {
        let Some(field) = self.config.dest_field.as_deref() else {
            return Ok(None);
        };
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if let Ok(boundary) = multer::parse_boundary(content_type) {
            let form = self
                .committer
                .receive(
                    body.into_data_stream(),
                    &boundary,
                    &self.config.file_field_name,
                )
                .await?;
            return Ok(form.field(field).map(str::to_string));
        }

        let essence = content_type.split(';').next().unwrap_or_default().trim();
        if !essence.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            return Ok(None);
        }
        let limit = self.config.max_form_buffer;
        let bytes = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX))
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    GatewayError::FormTooLarge { limit }
                } else {
                    GatewayError::MalformedBody(err.to_string())
                }
            })?
            .to_bytes();
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&bytes)
            .map_err(|err| GatewayError::MalformedBody(err.to_string()))?;
        Ok(pairs
            .into_iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value))
    }

    fn query_destination(&self, uri: &Uri) -> Option<String> {
        let field = self.config.dest_field.as_deref()?;
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
        params.get(field).cloned()
    }

    async fn resolve(
        &self,
        parts: &Parts,
        explicit: Option<&str>,
    ) -> Result<Destination, GatewayError> {
        paths::resolve(&self.config.root, parts.uri.path(), explicit).await
    }
}

/// Gateway middleware. Recognized verbs are executed and answered with an
/// envelope; the next stage still runs, with the outcome in its extensions.
pub async fn upload2dir(
    State(gateway): State<Arc<Gateway>>,
    jar: CookieJar,
    req: Request,
    next: middleware::Next,
) -> Response {
    let Some(action) = Operation::from_method(req.method()).action() else {
        return next.run(req).await;
    };

    let (mut parts, body) = req.into_parts();
    let ctx = RequestContext::from_parts(&parts);
    let token = jar
        .get(&gateway.config.token_cookie_key)
        .map(|cookie| cookie.value().to_string());
    let outcome = gateway
        .execute(action, token.as_deref(), &parts, body, &ctx)
        .await;

    if let Some(vars) = outcome.vars {
        parts.extensions.insert(vars);
    }
    parts.extensions.insert(outcome.envelope.clone());
    let _ = next.run(Request::from_parts(parts, AxumBody::empty())).await;

    envelope::respond(
        outcome.status,
        outcome.envelope,
        gateway.config.response_template.as_ref(),
    )
}

/// Gateway in front of a static file server over the same root.
pub fn router(gateway: Arc<Gateway>) -> Router {
    let root = gateway.config.root.clone();
    Router::new()
        .fallback_service(ServeDir::new(root))
        .layer(middleware::from_fn_with_state(gateway, upload2dir))
}
