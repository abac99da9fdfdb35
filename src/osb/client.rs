//! reqwest-backed OSB v2 client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::BrokerError;
use super::types::wire::{AsyncBody, BindBody, ErrorBody, LastOperationBody};
use super::types::*;
use super::BrokerClient;
use crate::retry::{retry_with_backoff_if, RetryConfig};

/// Header carrying the OSB API version on every request.
pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";
/// OSB API version spoken by this client.
pub const DEFAULT_API_VERSION: &str = "2.13";
/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Credentials presented to a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Everything needed to talk to one broker
#[derive(Debug, Clone)]
pub struct OsbClientConfig {
    pub name: String,
    pub url: String,
    pub auth: BrokerAuth,
    pub timeout: Duration,
    pub api_version: String,
    pub insecure_skip_tls_verify: bool,
    pub ca_bundle_pem: Option<Vec<u8>>,
    /// Retry applied to idempotent reads (catalog, polls, get binding)
    pub read_retry: RetryConfig,
}

impl OsbClientConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            auth: BrokerAuth::None,
            timeout: DEFAULT_TIMEOUT,
            api_version: DEFAULT_API_VERSION.to_string(),
            insecure_skip_tls_verify: false,
            ca_bundle_pem: None,
            read_retry: RetryConfig::with_max_attempts(3),
        }
    }
}

/// What kind of call is being made; decides how transport failures are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Read,
    Create,
    Update,
    Destructive,
}

struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// HTTP client for a single broker
pub struct OsbClient {
    name: String,
    base_url: String,
    auth: BrokerAuth,
    api_version: String,
    read_retry: RetryConfig,
    http: reqwest::Client,
}

impl OsbClient {
    pub fn new(config: OsbClientConfig) -> Result<Self, BrokerError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(pem) = &config.ca_bundle_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| BrokerError::InvalidRequest(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| BrokerError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;

        let parsed = reqwest::Url::parse(&config.url)
            .map_err(|e| BrokerError::InvalidRequest(format!("invalid broker URL {}: {}", config.url, e)))?;

        Ok(Self {
            name: config.name,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            auth: config.auth,
            api_version: config.api_version,
            read_retry: config.read_retry,
            http,
        })
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}/v2/service_instances/{}", self.base_url, instance_id)
    }

    fn binding_url(&self, instance_id: &str, binding_id: &str) -> String {
        format!(
            "{}/v2/service_instances/{}/service_bindings/{}",
            self.base_url, instance_id, binding_id
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(API_VERSION_HEADER, &self.api_version);
        match &self.auth {
            BrokerAuth::None => builder,
            BrokerAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            BrokerAuth::Bearer { token } => builder.bearer_auth(token),
        }
    }

    async fn send(&self, kind: CallKind, builder: RequestBuilder) -> Result<RawResponse, BrokerError> {
        let response = builder.send().await.map_err(|e| transport_error(kind, &e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(kind, &e))?
            .to_vec();
        debug!(broker = %self.name, status = status.as_u16(), "Broker responded");
        Ok(RawResponse { status, headers, body })
    }

    /// GET with retry on transient failures.
    async fn get_with_retry(&self, operation: &str, url: &str, query: &[(&str, String)]) -> Result<RawResponse, BrokerError> {
        retry_with_backoff_if(
            &self.read_retry,
            operation,
            |e: &BrokerError| matches!(e, BrokerError::Unreachable { .. }),
            || async move {
                let raw = self.send(CallKind::Read, self.request(Method::GET, url).query(query)).await?;
                if raw.status.is_server_error() {
                    return Err(classify_failure(CallKind::Read, raw.status.as_u16(), &raw.body));
                }
                Ok(raw)
            },
        )
        .await
    }
}

#[async_trait]
impl BrokerClient for OsbClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        let url = format!("{}/v2/catalog", self.base_url);
        let raw = self.get_with_retry("get_catalog", &url, &[]).await?;
        match raw.status.as_u16() {
            200 => parse_body(raw.status, &raw.body),
            status => Err(classify_failure(CallKind::Read, status, &raw.body)),
        }
    }

    async fn provision_instance(&self, r: &ProvisionRequest) -> Result<ProvisionResponse, BrokerError> {
        let builder = self
            .request(Method::PUT, &self.instance_url(&r.instance_id))
            .query(&accepts_incomplete_query(r.accepts_incomplete))
            .json(r);
        let raw = self.send(CallKind::Create, builder).await?;
        match raw.status.as_u16() {
            200 | 201 => {
                let body: AsyncBody = parse_body(raw.status, &raw.body)?;
                Ok(ProvisionResponse {
                    dashboard_url: body.dashboard_url,
                    operation_key: None,
                })
            }
            202 if r.accepts_incomplete => {
                let body: AsyncBody = parse_body(raw.status, &raw.body)?;
                Ok(ProvisionResponse {
                    dashboard_url: body.dashboard_url,
                    operation_key: Some(body.operation.unwrap_or_default()),
                })
            }
            status => Err(classify_failure(CallKind::Create, status, &raw.body)),
        }
    }

    async fn update_instance(&self, r: &UpdateInstanceRequest) -> Result<UpdateInstanceResponse, BrokerError> {
        let builder = self
            .request(Method::PATCH, &self.instance_url(&r.instance_id))
            .query(&accepts_incomplete_query(r.accepts_incomplete))
            .json(r);
        let raw = self.send(CallKind::Update, builder).await?;
        match raw.status.as_u16() {
            200 => {
                let body: AsyncBody = parse_lenient(&raw.body);
                Ok(UpdateInstanceResponse {
                    dashboard_url: body.dashboard_url,
                    operation_key: None,
                })
            }
            202 if r.accepts_incomplete => {
                let body: AsyncBody = parse_lenient(&raw.body);
                Ok(UpdateInstanceResponse {
                    dashboard_url: body.dashboard_url,
                    operation_key: Some(body.operation.unwrap_or_default()),
                })
            }
            status => Err(classify_failure(CallKind::Update, status, &raw.body)),
        }
    }

    async fn deprovision_instance(&self, r: &DeprovisionRequest) -> Result<DeprovisionResponse, BrokerError> {
        let mut query = vec![
            ("service_id", r.service_id.clone()),
            ("plan_id", r.plan_id.clone()),
        ];
        query.extend(accepts_incomplete_query(r.accepts_incomplete));
        let builder = self
            .request(Method::DELETE, &self.instance_url(&r.instance_id))
            .query(&query);
        let raw = self.send(CallKind::Destructive, builder).await?;
        match raw.status.as_u16() {
            200 => Ok(DeprovisionResponse { operation_key: None }),
            202 if r.accepts_incomplete => {
                let body: AsyncBody = parse_lenient(&raw.body);
                Ok(DeprovisionResponse {
                    operation_key: Some(body.operation.unwrap_or_default()),
                })
            }
            status => Err(classify_failure(CallKind::Destructive, status, &raw.body)),
        }
    }

    async fn poll_last_operation(&self, r: &LastOperationRequest) -> Result<LastOperationResponse, BrokerError> {
        let url = format!("{}/last_operation", self.instance_url(&r.instance_id));
        let query = last_operation_query(&r.service_id, &r.plan_id, &r.operation_key);
        let raw = self.get_with_retry("poll_last_operation", &url, &query).await?;
        last_operation_response(raw)
    }

    async fn poll_binding_last_operation(
        &self,
        r: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let url = format!("{}/last_operation", self.binding_url(&r.instance_id, &r.binding_id));
        let query = last_operation_query(&r.service_id, &r.plan_id, &r.operation_key);
        let raw = self.get_with_retry("poll_binding_last_operation", &url, &query).await?;
        last_operation_response(raw)
    }

    async fn bind(&self, r: &BindRequest) -> Result<BindResponse, BrokerError> {
        let builder = self
            .request(Method::PUT, &self.binding_url(&r.instance_id, &r.binding_id))
            .query(&accepts_incomplete_query(r.accepts_incomplete))
            .json(r);
        let raw = self.send(CallKind::Create, builder).await?;
        match raw.status.as_u16() {
            200 | 201 => bind_response(raw.status, &raw.body),
            202 if r.accepts_incomplete => {
                let body: BindBody = parse_lenient(&raw.body);
                Ok(BindResponse {
                    operation_key: Some(body.operation.unwrap_or_default()),
                    ..Default::default()
                })
            }
            status => Err(classify_failure(CallKind::Create, status, &raw.body)),
        }
    }

    async fn get_binding(&self, r: &GetBindingRequest) -> Result<BindResponse, BrokerError> {
        let url = self.binding_url(&r.instance_id, &r.binding_id);
        let raw = self.get_with_retry("get_binding", &url, &[]).await?;
        match raw.status.as_u16() {
            200 => bind_response(raw.status, &raw.body),
            status => Err(classify_failure(CallKind::Read, status, &raw.body)),
        }
    }

    async fn unbind(&self, r: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        let mut query = vec![
            ("service_id", r.service_id.clone()),
            ("plan_id", r.plan_id.clone()),
        ];
        query.extend(accepts_incomplete_query(r.accepts_incomplete));
        let builder = self
            .request(Method::DELETE, &self.binding_url(&r.instance_id, &r.binding_id))
            .query(&query);
        let raw = self.send(CallKind::Destructive, builder).await?;
        match raw.status.as_u16() {
            200 => Ok(UnbindResponse { operation_key: None }),
            202 if r.accepts_incomplete => {
                let body: AsyncBody = parse_lenient(&raw.body);
                Ok(UnbindResponse {
                    operation_key: Some(body.operation.unwrap_or_default()),
                })
            }
            status => Err(classify_failure(CallKind::Destructive, status, &raw.body)),
        }
    }
}

fn accepts_incomplete_query(accepts_incomplete: bool) -> Vec<(&'static str, String)> {
    if accepts_incomplete {
        vec![("accepts_incomplete", "true".to_string())]
    } else {
        Vec::new()
    }
}

fn last_operation_query(
    service_id: &Option<String>,
    plan_id: &Option<String>,
    operation_key: &Option<String>,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(v) = service_id {
        query.push(("service_id", v.clone()));
    }
    if let Some(v) = plan_id {
        query.push(("plan_id", v.clone()));
    }
    if let Some(v) = operation_key.as_ref().filter(|v| !v.is_empty()) {
        query.push(("operation", v.clone()));
    }
    query
}

fn last_operation_response(raw: RawResponse) -> Result<LastOperationResponse, BrokerError> {
    match raw.status.as_u16() {
        200 => {
            let body: LastOperationBody = parse_body(raw.status, &raw.body)?;
            Ok(LastOperationResponse {
                state: body.state,
                description: body.description,
                poll_delay: retry_after(&raw.headers),
            })
        }
        status => Err(classify_failure(CallKind::Read, status, &raw.body)),
    }
}

fn bind_response(status: StatusCode, body: &[u8]) -> Result<BindResponse, BrokerError> {
    let body: BindBody = parse_body(status, body)?;
    let credentials = body
        .credentials
        .ok_or_else(|| BrokerError::invalid_response(status.as_u16(), "bind response has no credentials"))?;
    Ok(BindResponse {
        credentials: Some(credentials),
        syslog_drain_url: body.syslog_drain_url,
        route_service_url: body.route_service_url,
        volume_mounts: body.volume_mounts,
        operation_key: None,
    })
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Parse a 2xx body; an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, BrokerError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) { b"{}".as_slice() } else { body };
    serde_json::from_slice(body)
        .map_err(|e| BrokerError::invalid_response(status.as_u16(), format!("unparseable body: {}", e)))
}

/// Parse a body whose content is optional for the caller.
fn parse_lenient<T: DeserializeOwned + Default>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

/// Map a reqwest transport error. A connect failure means nothing reached the
/// broker; anything later is ambiguous for a create-type call.
fn transport_error(kind: CallKind, err: &reqwest::Error) -> BrokerError {
    if err.is_builder() {
        return BrokerError::InvalidRequest(err.to_string());
    }
    if err.is_connect() || kind != CallKind::Create {
        return BrokerError::unreachable(err.to_string());
    }
    BrokerError::ambiguous(err.to_string())
}

/// Translate a non-success status into the error taxonomy.
pub(crate) fn classify_failure(kind: CallKind, status: u16, body: &[u8]) -> BrokerError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    match status {
        401 | 403 => BrokerError::Auth { status },
        404 if kind == CallKind::Destructive => BrokerError::Gone,
        408 if kind == CallKind::Create => BrokerError::ambiguous("broker returned 408 Request Timeout"),
        408 => BrokerError::unreachable("broker returned 408 Request Timeout"),
        409 => BrokerError::Conflict {
            message: parsed.description.or(parsed.error).unwrap_or_default(),
        },
        410 => BrokerError::Gone,
        422 => match parsed.error.as_deref() {
            Some("AsyncRequired") => BrokerError::AsyncRequired,
            Some("ConcurrencyError") => BrokerError::Concurrency,
            _ => BrokerError::Reported {
                status,
                error: parsed.error,
                description: parsed.description,
            },
        },
        400..=499 => BrokerError::Reported {
            status,
            error: parsed.error,
            description: parsed.description,
        },
        500..=599 if kind == CallKind::Create => {
            BrokerError::ambiguous(format!("broker returned {}", status))
        }
        500..=599 => BrokerError::unreachable(format!("broker returned {}", status)),
        _ => BrokerError::invalid_response(status, "unexpected status"),
    }
}
