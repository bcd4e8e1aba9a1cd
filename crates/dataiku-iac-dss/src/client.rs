//! Dataiku DSS public API client
//!
//! Implements [`LiveClient`] over the DSS REST API (`/public/api`), using
//! HTTP basic authentication with the API key as user name.

use crate::error::{DssError, Result};
use async_trait::async_trait;
use dataiku_iac_config::DssSettings;
use dataiku_iac_core::{Attributes, ResourceAddress, ResourceKind};
use dataiku_iac_state::{ClientError, LiveClient, LiveResource};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const API_PREFIX: [&str; 2] = ["public", "api"];
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY: usize = 200;

/// Connection settings
#[derive(Clone)]
pub struct DssConfig {
    pub url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for DssConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssConfig")
            .field("url", &self.url)
            .field("api_key", &"***")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl DssConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Build from settings, reading the API key from `api_key_env`
    pub fn from_settings(settings: &DssSettings) -> Result<Self> {
        let url = settings.url.clone().ok_or(DssError::MissingUrl)?;
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DssError::MissingApiKey(settings.api_key_env.clone()))?;
        Ok(Self::new(url, api_key))
    }
}

pub struct DssClient {
    http: reqwest::Client,
    base: String,
    root: Url,
    api_key: String,
}

impl DssClient {
    pub fn new(config: DssConfig) -> Result<Self> {
        let base = config.url.trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(DssError::InvalidUrl {
                url: config.url,
                message: "expected an http:// or https:// URL".to_string(),
            });
        }
        let root = Url::parse(&base).map_err(|e| DssError::InvalidUrl {
            url: config.url.clone(),
            message: e.to_string(),
        })?;
        if root.cannot_be_a_base() {
            return Err(DssError::InvalidUrl {
                url: config.url,
                message: "URL cannot carry a path".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base,
            root,
            api_key: config.api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// API URL of `segments`, each percent-encoded as one path segment
    pub fn api_url(&self, segments: &[String]) -> std::result::Result<Url, ClientError> {
        let mut url = self.root.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Permanent(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        segments: &[String],
        body: Option<&Value>,
    ) -> std::result::Result<(StatusCode, String), ClientError> {
        let url = self.api_url(segments)?;
        debug!(method = %method, url = %url, "DSS request");

        let mut builder = self
            .http
            .request(method, url)
            .basic_auth(&self.api_key, Some(""));
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        Ok((status, text))
    }
}

/// Collection and item path segments of a resource, below the API prefix
///
/// A trailing empty segment stands for a trailing slash.
pub fn endpoint(address: &ResourceAddress) -> (Vec<String>, Vec<String>) {
    let project = address.project_key().to_string();
    let name = address.name.clone();
    match address.kind {
        ResourceKind::Project => (
            segments(&["projects", ""]),
            segments(&["projects", &project, ""]),
        ),
        ResourceKind::Dataset => (
            segments(&["projects", &project, "datasets", ""]),
            segments(&["projects", &project, "datasets", &name]),
        ),
        ResourceKind::Recipe => (
            segments(&["projects", &project, "recipes", ""]),
            segments(&["projects", &project, "recipes", &name]),
        ),
        ResourceKind::Scenario => (
            segments(&["projects", &project, "scenarios", ""]),
            segments(&["projects", &project, "scenarios", &name, ""]),
        ),
    }
}

fn segments(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Request body: managed attributes plus the identity fields DSS expects
pub fn request_body(address: &ResourceAddress, attributes: &Attributes) -> Value {
    let mut body: serde_json::Map<String, Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    body.entry("projectKey")
        .or_insert_with(|| Value::String(address.project_key().to_string()));
    match address.kind {
        ResourceKind::Project => {}
        ResourceKind::Dataset | ResourceKind::Recipe => {
            body.entry("name")
                .or_insert_with(|| Value::String(address.name.clone()));
        }
        ResourceKind::Scenario => {
            body.entry("id")
                .or_insert_with(|| Value::String(address.name.clone()));
        }
    }
    Value::Object(body)
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str) -> ClientError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect());
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ClientError::Transient(message)
    } else {
        ClientError::Permanent(message)
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ClientError::Transient(err.to_string())
    } else {
        ClientError::Permanent(err.to_string())
    }
}

fn parse_object(body: &str) -> Attributes {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Attributes::new(),
    }
}

fn remote_id(address: &ResourceAddress, response: &Attributes) -> Option<String> {
    let field = match address.kind {
        ResourceKind::Project => "projectKey",
        ResourceKind::Scenario => "id",
        ResourceKind::Dataset | ResourceKind::Recipe => "name",
    };
    let id = response
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or(address.name.as_str());
    Some(id.to_string())
}

/// Live view after a write: managed keys as echoed by DSS, falling back to
/// what was sent when the response omits them
fn observed(attributes: &Attributes, response: &Attributes) -> Attributes {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), response.get(k).cloned().unwrap_or_else(|| v.clone())))
        .collect()
}

#[async_trait]
impl LiveClient for DssClient {
    #[instrument(skip_all, fields(address = %address))]
    async fn read_resource(
        &self,
        address: &ResourceAddress,
    ) -> std::result::Result<Option<LiveResource>, ClientError> {
        let (_, item) = endpoint(address);
        let (status, body) = self.request(Method::GET, &item, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let attributes = parse_object(&body);
        Ok(Some(LiveResource::new(
            remote_id(address, &attributes),
            attributes,
        )))
    }

    #[instrument(skip_all, fields(address = %address))]
    async fn create_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> std::result::Result<LiveResource, ClientError> {
        let (collection, _) = endpoint(address);
        let body = request_body(address, attributes);
        let (status, text) = self.request(Method::POST, &collection, Some(&body)).await?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        let response = parse_object(&text);
        Ok(LiveResource::new(
            remote_id(address, &response),
            observed(attributes, &response),
        ))
    }

    #[instrument(skip_all, fields(address = %address))]
    async fn update_resource(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> std::result::Result<LiveResource, ClientError> {
        let (_, item) = endpoint(address);
        let body = request_body(address, attributes);
        let (status, text) = self.request(Method::PUT, &item, Some(&body)).await?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        let response = parse_object(&text);
        Ok(LiveResource::new(
            remote_id(address, &response),
            observed(attributes, &response),
        ))
    }

    #[instrument(skip_all, fields(address = %address))]
    async fn delete_resource(
        &self,
        address: &ResourceAddress,
    ) -> std::result::Result<(), ClientError> {
        let (_, item) = endpoint(address);
        let (status, body) = self.request(Method::DELETE, &item, None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(status, &body))
        }
    }
}
