//! Generic JSON-over-HTTP backend adapter.
//!
//! Every backend kind is reached through the same small route set rooted at
//! the configured link URL. Calls act as the context identity through the
//! `X-Aperture-Act-As` header and authenticate with the link token, if any.
//!
//! | operation              | route                                          |
//! |------------------------|------------------------------------------------|
//! | `create_service`       | `POST   /projects`                             |
//! | `destroy_service`      | `DELETE /projects/{key}`                       |
//! | `is_service_available` | `GET    /projects/{key}`                       |
//! | `modify_users`         | `PUT/DELETE /projects/{key}/roles/{role}/users`  |
//! | `modify_groups`        | `PUT/DELETE /projects/{key}/roles/{role}/groups` |
//! | `is_idle`              | `GET    /projects/{key}/activity?since={secs}` |

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::{BackendError, BackendResult};
use crate::outcome::OperationResult;
use crate::settings::BackendLink;
use crate::types::{BackendKind, CallContext, PermissionMode, ProjectRequest, Role};

use super::Backend;

pub const ACT_AS_HEADER: &str = "X-Aperture-Act-As";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RestBackend {
    kind: BackendKind,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ActivityResponse {
    idle: bool,
}

impl RestBackend {
    pub fn new(kind: BackendKind, link: BackendLink) -> Self {
        Self {
            kind,
            base_url: link.url.trim_end_matches('/').to_string(),
            token: link.token,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // The blocking client owns a private runtime, so it is built and dropped
    // on the calling (blocking pool) thread rather than stored.
    fn request(&self, ctx: &CallContext, method: Method, path: &str) -> BackendResult<RequestBuilder> {
        let client = Client::builder().timeout(self.timeout).build()?;
        let mut req = client
            .request(method, format!("{}{path}", self.base_url))
            .header(ACT_AS_HEADER, &ctx.identity.username);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    /// Map a mutation response: 2xx is success, 4xx is a rejection carrying
    /// the backend's message, anything else is a fault.
    fn outcome(&self, response: Response) -> BackendResult<OperationResult> {
        let status = response.status();
        if status.is_success() {
            return Ok(OperationResult::ok(self.kind));
        }
        let body = response.text().unwrap_or_default();
        if status.is_client_error() {
            return Ok(OperationResult::rejected(
                self.kind,
                rejection_messages(status, &body),
            ));
        }
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn modify(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        collection: &str,
        names: &[String],
    ) -> BackendResult<OperationResult> {
        let method = if mode.grants() {
            Method::PUT
        } else {
            Method::DELETE
        };
        let path = format!("/projects/{project_key}/roles/{role}/{collection}");
        let response = self
            .request(ctx, method, &path)?
            .json(&json!({ "names": names, "mode": mode }))
            .send()?;
        self.outcome(response)
    }
}

/// Pull human-readable messages out of a 4xx body.
///
/// Accepts `{"errors": [..]}`, `{"message": ".."}`, or falls back to the raw
/// text (or the status line when the body is empty).
fn rejection_messages(status: StatusCode, body: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(errors) = value.get("errors").and_then(|v| v.as_array()) {
            let messages: Vec<String> = errors
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect();
            if !messages.is_empty() {
                return messages;
            }
        }
        if let Some(message) = value.get("message").and_then(|v| v.as_str()) {
            return vec![message.to_string()];
        }
    }
    let text = body.trim();
    if text.is_empty() {
        vec![format!("rejected with status {status}")]
    } else {
        vec![text.to_string()]
    }
}

impl Backend for RestBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_service(
        &self,
        ctx: &CallContext,
        request: &ProjectRequest,
    ) -> BackendResult<OperationResult> {
        let response = self
            .request(ctx, Method::POST, "/projects")?
            .json(&json!({
                "key": request.project_key,
                "name": request.name,
                "description": request.description,
                "lead": request.requested_by,
                "category": request.category,
                "class": request.class,
            }))
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            tracing::debug!(backend = %self.kind, project = %request.project_key, "resource already exists");
            return Ok(OperationResult::ok(self.kind));
        }
        self.outcome(response)
    }

    fn destroy_service(
        &self,
        ctx: &CallContext,
        project_key: &str,
    ) -> BackendResult<OperationResult> {
        let sent = self
            .request(ctx, Method::DELETE, &format!("/projects/{project_key}"))
            .and_then(|req| req.send().map_err(BackendError::from));
        // Teardown keeps going: transport and server faults are reported as
        // errors on this backend's entry instead of surfacing as a fault.
        let response = match sent {
            Ok(response) => response,
            Err(e) => return Ok(OperationResult::server_error(self.kind, e.to_string())),
        };
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(OperationResult::ok(self.kind));
        }
        match self.outcome(response) {
            Ok(result) => Ok(result),
            Err(e) => Ok(OperationResult::server_error(self.kind, e.to_string())),
        }
    }

    fn modify_users(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        users: &[String],
    ) -> BackendResult<OperationResult> {
        self.modify(ctx, project_key, mode, role, "users", users)
    }

    fn modify_groups(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        groups: &[String],
    ) -> BackendResult<OperationResult> {
        self.modify(ctx, project_key, mode, role, "groups", groups)
    }

    fn is_service_available(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool> {
        let response = self
            .request(ctx, Method::GET, &format!("/projects/{project_key}"))?
            .send()?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(BackendError::Status {
                status: s.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }

    fn is_idle(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool> {
        let path = format!(
            "/projects/{project_key}/activity?since={}",
            ctx.idle_threshold.as_secs()
        );
        let response = self.request(ctx, Method::GET, &path)?.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let activity: ActivityResponse = response.json()?;
        Ok(activity.idle)
    }
}
