//! REST API adapter.
//!
//! One `reqwest::Client` per instance, one resolved auth scheme per
//! `initialize`. A 401 on an OAuth connector with a refresh token goes
//! through the [`refresh::RefreshCoordinator`] and the request is replayed
//! once with the renewed token.

pub mod auth;
pub mod refresh;
pub mod schema;

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use conduit::config::CountSource;
use conduit::rate_limit::RateLimitConfig;
use conduit::{ConnectorError, Result};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{check_binding, first_str, not_initialized, open_credentials, with_timeout, AdapterContext};
use crate::connector::Connector;
use crate::retry::with_retry;
use crate::schema::Schema;
use crate::tracker::InstanceMetrics;
use crate::types::{
    Action, ActionKind, ActionResult, ConnectorConfig, ConnectorType, HealthStatus, InstanceStats,
    PerformanceMetrics, QueryOperation, QueryParams, QueryResult, ResultMetadata, Row, SortDirection,
    TestResult,
};
use crate::validation::{effective_limit, validate_action, validate_query};
use auth::AuthScheme;
use refresh::{RefreshCoordinator, TokenClient};

/// Body keys that may wrap the row array of a response.
const ENVELOPE_KEYS: &[&str] = &["data", "items", "results", "records"];

/// Longest response excerpt carried in an error message.
const ERROR_BODY_EXCERPT: usize = 200;

/// Where `get_schema` gets its answer.
enum SchemaSource {
    OpenApi(String),
    Manual(Value),
    None,
}

/// Response of one successful call.
struct ApiResponse {
    headers: HeaderMap,
    body: Value,
}

/// Live state, present between `initialize` and `dispose`.
struct Session {
    base_url: String,
    auth: AuthScheme,
    refresher: Option<RefreshCoordinator>,
    extra_headers: Vec<(String, String)>,
    rate_limit: Option<RateLimitConfig>,
    test_endpoint: String,
    schema_source: SchemaSource,
    limit_param: String,
    offset_param: String,
    search_param: String,
}

impl Session {
    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

pub struct ApiConnector {
    id: String,
    ctx: AdapterContext,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
    metrics: InstanceMetrics,
}

impl ApiConnector {
    pub fn new(id: &str, ctx: AdapterContext) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(ctx.settings.http.user_agent.clone())
            .build()
            .map_err(|e| ConnectorError::ConnectionFailed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            id: id.to_string(),
            ctx,
            http,
            session: RwLock::new(None),
            metrics: InstanceMetrics::new(),
        })
    }

    /// One call with retry on transient failures and a single replay after
    /// an OAuth refresh.
    async fn call(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let label = format!("api.{}", method.as_str().to_ascii_lowercase());
        with_retry(&self.ctx.settings.retry, &label, || {
            self.call_with_refresh(session, method.clone(), path, query, body)
        })
        .await
    }

    async fn call_with_refresh(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let token = session.refresher.as_ref().map(|r| r.access_token());
        let (status, headers, text) = self
            .send_once(session, method.clone(), path, query, body, token.as_deref())
            .await?;

        if status == StatusCode::UNAUTHORIZED {
            if let (Some(refresher), Some(stale)) = (&session.refresher, token.as_deref()) {
                debug!(connector_id = %self.id, "Backend rejected token, renewing");
                let fresh = refresher.renew(stale).await?;
                let (status, headers, text) = self
                    .send_once(session, method.clone(), path, query, body, Some(&fresh))
                    .await?;
                return interpret(&method, path, status, headers, text);
            }
        }
        interpret(&method, path, status, headers, text)
    }

    async fn send_once(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        oauth_token: Option<&str>,
    ) -> Result<(StatusCode, HeaderMap, String)> {
        let url = session.url_for(path);
        let mut request = self
            .http
            .request(method, &url)
            .header("Accept", "application/json");
        for (name, value) in &session.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request = session.auth.apply(request, oauth_token);

        with_timeout(self.ctx.call_timeout(), async {
            let response = request.send().await.map_err(map_transport_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let text = response.text().await.map_err(map_transport_error)?;
            Ok((status, headers, text))
        })
        .await
    }

    fn query_string(&self, session: &Session, params: &QueryParams) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        if let Some(filters) = &params.filters {
            for (key, value) in filters {
                let rendered = match value {
                    Value::Null => continue,
                    Value::String(s) => s.clone(),
                    Value::Array(items) => items
                        .iter()
                        .map(scalar_to_string)
                        .collect::<Result<Vec<_>>>()?
                        .join(","),
                    Value::Object(_) => {
                        return Err(ConnectorError::Validation(format!(
                            "filter operators are not supported by API connectors ({})",
                            key
                        )))
                    }
                    other => other.to_string(),
                };
                pairs.push((key.clone(), rendered));
            }
        }

        let limit = effective_limit(params, &self.ctx.settings.query);
        pairs.push((session.limit_param.clone(), limit.to_string()));
        if let Some(offset) = params.offset.filter(|o| *o > 0) {
            pairs.push((session.offset_param.clone(), offset.to_string()));
        }
        if let Some(fields) = params.fields.as_ref().filter(|f| !f.is_empty()) {
            pairs.push(("fields".to_string(), fields.join(",")));
        }
        if !params.sort.is_empty() {
            let sort = params
                .sort
                .iter()
                .map(|s| match s.direction {
                    SortDirection::Asc => s.field.clone(),
                    SortDirection::Desc => format!("-{}", s.field),
                })
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("sort".to_string(), sort));
        }
        if let Some(search) = &params.search {
            pairs.push((session.search_param.clone(), search.term.clone()));
        }
        Ok(pairs)
    }

    /// Total count inferred from headers or body, in the configured order.
    fn infer_total(&self, response: &ApiResponse) -> Option<u64> {
        let settings = &self.ctx.settings.query;
        settings.count_sources.iter().find_map(|source| match source {
            CountSource::Header => settings.count_headers.iter().find_map(|name| {
                response
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
            }),
            CountSource::Body => {
                let obj = response.body.as_object()?;
                settings.count_fields.iter().find_map(|field| {
                    obj.get(field)
                        .or_else(|| obj.get("meta").and_then(|m| m.get(field)))
                        .and_then(Value::as_u64)
                })
            }
        })
    }

    async fn run_query(&self, session: &Session, params: &QueryParams) -> Result<QueryResult> {
        if params.operation == QueryOperation::Aggregate {
            return Err(ConnectorError::Validation(
                "aggregate queries are not supported by API connectors".into(),
            ));
        }
        let query = self.query_string(session, params)?;

        let started = Instant::now();
        let response = self
            .call(session, Method::GET, &params.resource, &query, None)
            .await?;
        let total = self.infer_total(&response);
        let rows = extract_rows(&response.body);

        let offset = params.offset.unwrap_or(0) as u64;
        let has_more = match total {
            Some(total) => offset + (rows.len() as u64) < total,
            None => response
                .body
                .get("hasMore")
                .or_else(|| response.body.get("has_more"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        let row_count = rows.len();
        debug!(
            connector_id = %self.id,
            resource = %params.resource,
            rows = row_count,
            total = ?total,
            "API query complete"
        );
        Ok(QueryResult {
            rows,
            metadata: ResultMetadata { total, has_more },
            performance: PerformanceMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                row_count,
            },
        })
    }

    async fn run_action(&self, session: &Session, action: &Action) -> Result<ActionResult> {
        let (path, query) = target_for(action)?;
        let method = match action.kind {
            ActionKind::Create => Method::POST,
            ActionKind::Update => Method::PUT,
            ActionKind::Delete => Method::DELETE,
            ActionKind::Execute => match action.method.as_deref() {
                Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| ConnectorError::Validation(format!("invalid HTTP method {}", m)))?,
                None => Method::POST,
            },
        };

        let started = Instant::now();
        let response = self
            .call(session, method, &path, &query, action.payload.as_ref())
            .await?;
        // Counts what the backend echoed back; an empty 204 reports none
        let rows = extract_rows(&response.body);
        let row_count = rows.len();
        Ok(ActionResult {
            success: true,
            affected_rows: row_count as u64,
            rows,
            performance: PerformanceMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                row_count,
            },
        })
    }

    async fn fetch_schema(&self, session: &Session) -> Result<Schema> {
        match &session.schema_source {
            SchemaSource::OpenApi(url) => {
                let response = self.call(session, Method::GET, url, &[], None).await?;
                Ok(schema::parse_openapi(&response.body))
            }
            SchemaSource::Manual(value) => schema::parse_manual(value).ok_or_else(|| {
                ConnectorError::Validation("manual schema option is malformed".into())
            }),
            SchemaSource::None => Ok(Schema::empty(schema::DEFAULT_CAPABILITIES)),
        }
    }
}

/// Path and query string of an action: a single `id` in the match predicate
/// becomes a path segment, anything else is sent as query parameters.
fn target_for(action: &Action) -> Result<(String, Vec<(String, String)>)> {
    let mut path = action.resource.trim_end_matches('/').to_string();
    let mut query = Vec::new();
    if let Some(predicate) = &action.match_predicate {
        for (key, value) in predicate {
            let rendered = scalar_to_string(value)?;
            if key == "id" {
                path = format!("{}/{}", path, urlencoding::encode(&rendered));
            } else {
                query.push((key.clone(), rendered));
            }
        }
    }
    Ok((path, query))
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) => Ok(value.to_string()),
        _ => Err(ConnectorError::Validation(
            "API parameters must be scalar values".into(),
        )),
    }
}

/// Rows of a response body: a top-level array, the first envelope array, or
/// the object itself.
pub fn extract_rows(body: &Value) -> Vec<Row> {
    let items = match body {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        Value::Object(obj) => match ENVELOPE_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return vec![obj.clone()],
        },
        other => {
            let mut row = Row::new();
            row.insert("value".to_string(), other.clone());
            return vec![row];
        }
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(obj) => obj.clone(),
            other => {
                let mut row = Row::new();
                row.insert("value".to_string(), other.clone());
                row
            }
        })
        .collect()
}

fn interpret(
    method: &Method,
    path: &str,
    status: StatusCode,
    headers: HeaderMap,
    text: String,
) -> Result<ApiResponse> {
    if status.is_success() {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        return Ok(ApiResponse { headers, body });
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ConnectorError::InvalidCredentials(
            format!("backend rejected credentials with status {}", status.as_u16()),
        )),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_ms = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(0);
            Err(ConnectorError::RateLimitExceeded { retry_after_ms })
        }
        _ => {
            let excerpt: String = text.chars().take(ERROR_BODY_EXCERPT).collect();
            Err(ConnectorError::QueryFailed {
                message: format!(
                    "{} /{} returned {}: {}",
                    method,
                    path.trim_start_matches('/'),
                    status.as_u16(),
                    excerpt
                ),
                status: Some(status.as_u16()),
            })
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_connect() {
        ConnectorError::ConnectionFailed("backend unreachable".to_string())
    } else {
        ConnectorError::ConnectionFailed(format!("request failed: {}", e.without_url()))
    }
}

fn string_option(options: &Map<String, Value>, key: &str, default: &str) -> String {
    first_str(options, &[key]).unwrap_or(default).to_string()
}

#[async_trait]
impl Connector for ApiConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Api
    }

    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self, config: &ConnectorConfig) -> Result<()> {
        check_binding(&self.id, ConnectorType::Api, config)?;

        let mut session = self.session.write().await;
        session.take();

        let creds = open_credentials(&self.ctx.vault, config)?;
        let base_url = first_str(&config.options, &["baseUrl", "base_url"])
            .or_else(|| first_str(&creds, &["baseUrl"]))
            .ok_or_else(|| ConnectorError::Validation("API connector requires a baseUrl option".into()))?
            .trim_end_matches('/')
            .to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|_| ConnectorError::Validation(format!("invalid baseUrl {}", base_url)))?;

        let auth = AuthScheme::resolve(&creds, &config.options);
        let refresher = match &auth {
            AuthScheme::OAuth {
                access_token,
                refresh_token: Some(refresh_token),
                client_id,
                client_secret,
            } => Some(RefreshCoordinator::new(
                TokenClient {
                    http: self.http.clone(),
                    token_url: refresh::token_endpoint(
                        first_str(&config.options, &["tokenUrl"]),
                        &base_url,
                    ),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    timeout: self.ctx.call_timeout(),
                },
                access_token.clone(),
                refresh_token.clone(),
            )),
            _ => None,
        };
        drop(creds);

        let extra_headers = config
            .options
            .get("headers")
            .and_then(Value::as_object)
            .map(|h| {
                h.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let schema_source = if let Some(url) = first_str(&config.options, &["schemaUrl", "openApiUrl"]) {
            SchemaSource::OpenApi(url.to_string())
        } else if let Some(manual) = config.options.get("schema") {
            SchemaSource::Manual(manual.clone())
        } else {
            SchemaSource::None
        };

        let candidate = Session {
            base_url,
            auth,
            refresher,
            extra_headers,
            rate_limit: config.rate_limit.clone(),
            test_endpoint: string_option(&config.options, "testEndpoint", ""),
            schema_source,
            limit_param: string_option(&config.options, "limitParam", "limit"),
            offset_param: string_option(&config.options, "offsetParam", "offset"),
            search_param: string_option(&config.options, "searchParam", "q"),
        };

        // Reachability check: any HTTP response counts
        let token = candidate.refresher.as_ref().map(|r| r.access_token());
        let (status, _, _) = self
            .send_once(&candidate, Method::GET, "", &[], None, token.as_deref())
            .await?;

        info!(
            connector_id = %self.id,
            base_url = %candidate.base_url,
            auth = candidate.auth.kind(),
            refreshable = candidate.refresher.is_some(),
            check_status = status.as_u16(),
            "API connector initialized"
        );
        *session = Some(candidate);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if session.take().is_some() {
            info!(connector_id = %self.id, "API connector disposed");
        }
        Ok(())
    }

    async fn is_initialized(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn test(&self) -> Result<TestResult> {
        let started = Instant::now();
        let outcome = self
            .metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                self.ctx.limiter.acquire(&self.id, session.rate_limit.as_ref())?;
                self.call(session, Method::GET, &session.test_endpoint, &[], None)
                    .await
                    .map(|_| ())
            })
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => Ok(TestResult {
                success: true,
                message: "Connection successful".to_string(),
                latency_ms,
            }),
            Err(e @ (ConnectorError::NotInitialized(_) | ConnectorError::RateLimitExceeded { .. })) => Err(e),
            Err(e) => {
                warn!(connector_id = %self.id, error = %e, "API connection test failed");
                Ok(TestResult {
                    success: false,
                    message: e.to_string(),
                    latency_ms,
                })
            }
        }
    }

    async fn query(&self, params: &QueryParams) -> Result<QueryResult> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                validate_query(params, &self.ctx.settings.query)?;
                self.ctx.limiter.acquire(&self.id, session.rate_limit.as_ref())?;
                self.run_query(session, params).await
            })
            .await
    }

    async fn execute(&self, action: &Action) -> Result<ActionResult> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                validate_action(action)?;
                self.ctx.limiter.acquire(&self.id, session.rate_limit.as_ref())?;
                self.run_action(session, action).await
            })
            .await
    }

    async fn get_schema(&self) -> Result<Schema> {
        self.metrics
            .track(async {
                let guard = self.session.read().await;
                let session = guard.as_ref().ok_or_else(|| not_initialized(&self.id))?;
                self.ctx.limiter.acquire(&self.id, session.rate_limit.as_ref())?;
                self.fetch_schema(session).await
            })
            .await
    }

    async fn health_status(&self) -> HealthStatus {
        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return HealthStatus {
                healthy: false,
                initialized: false,
                latency_ms: None,
                message: Some("not initialized".to_string()),
                checked_at: Utc::now(),
            };
        };

        let started = Instant::now();
        let token = session.refresher.as_ref().map(|r| r.access_token());
        let outcome = self
            .send_once(session, Method::GET, &session.test_endpoint, &[], None, token.as_deref())
            .await;
        let (healthy, message) = match outcome {
            Ok((status, _, _)) if status.is_server_error() => {
                (false, Some(format!("backend returned {}", status.as_u16())))
            }
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        HealthStatus {
            healthy,
            initialized: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            message,
            checked_at: Utc::now(),
        }
    }

    fn stats(&self) -> InstanceStats {
        self.metrics.snapshot()
    }
}
