use chrono::{DateTime, Utc};
use conduit::error::{ConnectorError, ErrorKind, Result};
use conduit::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row: column/field name → value.
pub type Row = Map<String, Value>;

/// Backend family of a connector. Selects the adapter once, at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorType {
    Database,
    Api,
    /// Reserved, no adapter yet.
    Saas,
    /// Reserved, no adapter yet.
    File,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Database => "DATABASE",
            ConnectorType::Api => "API",
            ConnectorType::Saas => "SAAS",
            ConnectorType::File => "FILE",
        }
    }
}

impl std::str::FromStr for ConnectorType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DATABASE" => Ok(ConnectorType::Database),
            "API" => Ok(ConnectorType::Api),
            "SAAS" => Ok(ConnectorType::Saas),
            "FILE" => Ok(ConnectorType::File),
            other => Err(ConnectorError::Validation(format!(
                "unknown connector type '{}'",
                other
            ))),
        }
    }
}

/// Health of a connector as last observed by `test_connector`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorStatus {
    /// Created, not yet tested.
    Pending,
    Active,
    Error,
    Inactive,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Pending => "PENDING",
            ConnectorStatus::Active => "ACTIVE",
            ConnectorStatus::Error => "ERROR",
            ConnectorStatus::Inactive => "INACTIVE",
        }
    }
}

impl std::str::FromStr for ConnectorStatus {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ConnectorStatus::Pending),
            "ACTIVE" => Ok(ConnectorStatus::Active),
            "ERROR" => Ok(ConnectorStatus::Error),
            "INACTIVE" => Ok(ConnectorStatus::Inactive),
            other => Err(ConnectorError::Validation(format!(
                "unknown connector status '{}'",
                other
            ))),
        }
    }
}

/// Credentials of a connector: plaintext before persistence, a sealed blob at rest.
///
/// `Debug` never prints plaintext values.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectorCredentials {
    /// Blob produced by `SecretVault::encrypt_structured`.
    Encrypted(String),
    /// Plaintext map; must never reach storage.
    Plain(Map<String, Value>),
}

impl ConnectorCredentials {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, ConnectorCredentials::Encrypted(_))
    }
}

impl std::fmt::Debug for ConnectorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorCredentials::Encrypted(_) => f.write_str("Encrypted(..)"),
            ConnectorCredentials::Plain(map) => {
                let keys: Vec<&String> = map.keys().collect();
                write!(f, "Plain(keys={:?})", keys)
            }
        }
    }
}

/// Usage counters kept by the persistence layer. Survive instance eviction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedStats {
    pub request_count: u64,
    pub error_count: u64,
    /// Moving average over all recorded requests.
    pub avg_latency_ms: f64,
}

impl PersistedStats {
    /// Folds one request into the counters.
    pub fn record(&mut self, duration_ms: u64, is_error: bool) {
        let n = self.request_count as f64;
        self.avg_latency_ms = (self.avg_latency_ms * n + duration_ms as f64) / (n + 1.0);
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        }
    }
}

/// Persisted configuration of one connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unique connector ID (UUIDv7).
    pub id: String,
    pub organization_id: String,
    pub name: String,
    /// URL-safe form of `name`, unique per organization.
    pub slug: String,
    pub connector_type: ConnectorType,
    /// Backend flavor, e.g. `"postgres"`, `"sqlite"`, `"rest"`, `"hubspot"`.
    pub provider: String,
    pub description: Option<String>,
    /// Free-form adapter options (base URL, schema URL, test endpoint, ...).
    pub options: Map<String, Value>,
    pub credentials: ConnectorCredentials,
    pub rate_limit: Option<RateLimitConfig>,
    pub status: ConnectorStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: PersistedStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorConfig {
    /// String option lookup.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// Input for `ConnectorService::create_connector`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnector {
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl NewConnector {
    pub fn new(name: impl Into<String>, connector_type: ConnectorType) -> Self {
        Self {
            name: name.into(),
            connector_type,
            provider: None,
            description: None,
            options: Map::new(),
            credentials: Map::new(),
            rate_limit: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: Value) -> Self {
        self.credentials.insert(key.into(), value);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

/// Input for `ConnectorService::update_connector`. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
    /// Replaces the stored credentials entirely.
    #[serde(default)]
    pub credentials: Option<Map<String, Value>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl ConnectorUpdate {
    /// Whether applying this update invalidates a live instance.
    pub fn touches_runtime(&self) -> bool {
        self.options.is_some() || self.credentials.is_some() || self.rate_limit.is_some()
    }
}

// ── Queries ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOperation {
    Read,
    Search,
    Aggregate,
}

impl QueryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOperation::Read => "read",
            QueryOperation::Search => "search",
            QueryOperation::Aggregate => "aggregate",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Free-text search over a set of fields (`search` operation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub term: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// Aggregate specification (`aggregate` operation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    /// Aggregated field; `None` only for `count`.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
}

/// Structured read request.
///
/// Filter values: a scalar means equality, `null` means "is null", an array
/// means "one of", and an object maps operators (`$eq`, `$ne`, `$gt`, `$gte`,
/// `$lt`, `$lte`, `$in`, `$like`) to operands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub operation: QueryOperation,
    pub resource: String,
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub search: Option<SearchSpec>,
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
}

impl QueryParams {
    pub fn read(resource: impl Into<String>) -> Self {
        Self {
            operation: QueryOperation::Read,
            resource: resource.into(),
            filters: None,
            limit: None,
            offset: None,
            fields: None,
            sort: Vec::new(),
            search: None,
            aggregate: None,
        }
    }

    pub fn search(resource: impl Into<String>, term: impl Into<String>, fields: &[&str]) -> Self {
        let mut params = Self::read(resource);
        params.operation = QueryOperation::Search;
        params.search = Some(SearchSpec {
            term: term.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        params
    }

    pub fn aggregate(resource: impl Into<String>, spec: AggregateSpec) -> Self {
        let mut params = Self::read(resource);
        params.operation = QueryOperation::Aggregate;
        params.aggregate = Some(spec);
        params
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters
            .get_or_insert_with(Map::new)
            .insert(field.into(), value);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }
}

// ── Actions ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Execute,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Execute => "execute",
        }
    }
}

/// Structured mutation request.
///
/// For database connectors `execute` runs `payload.statement` with
/// `payload.params`; for API connectors it sends `payload` with `method`
/// (default `POST`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub kind: ActionKind,
    pub resource: String,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Row selector; required for update and delete.
    #[serde(default, rename = "match")]
    pub match_predicate: Option<Map<String, Value>>,
    /// Custom HTTP verb for API `execute`.
    #[serde(default)]
    pub method: Option<String>,
}

impl Action {
    fn new(kind: ActionKind, resource: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
            payload: None,
            match_predicate: None,
            method: None,
        }
    }

    pub fn create(resource: impl Into<String>, payload: Value) -> Self {
        Self::new(ActionKind::Create, resource).with_payload(payload)
    }

    pub fn update(resource: impl Into<String>, payload: Value, predicate: Map<String, Value>) -> Self {
        Self::new(ActionKind::Update, resource)
            .with_payload(payload)
            .with_match(predicate)
    }

    pub fn delete(resource: impl Into<String>, predicate: Map<String, Value>) -> Self {
        Self::new(ActionKind::Delete, resource).with_match(predicate)
    }

    pub fn execute(resource: impl Into<String>, payload: Value) -> Self {
        Self::new(ActionKind::Execute, resource).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_match(mut self, predicate: Map<String, Value>) -> Self {
        self.match_predicate = Some(predicate);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    /// Total matching rows when cheaply knowable.
    pub total: Option<u64>,
    pub has_more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub duration_ms: u64,
    pub row_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub metadata: ResultMetadata,
    pub performance: PerformanceMetrics,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    pub affected_rows: u64,
    /// Rows returned by the backend (inserted/updated rows, API response body).
    pub rows: Vec<Row>,
    pub performance: PerformanceMetrics,
}

/// Outcome of `Connector::test`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub initialized: bool,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// In-memory counters of one live instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStats {
    pub request_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
}

/// Combined statistics returned by `ConnectorService::get_connector_stats`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStats {
    pub connector_id: String,
    pub status: ConnectorStatus,
    /// Whether a live instance is currently cached.
    pub cached: bool,
    pub instance: Option<InstanceStats>,
    pub instance_created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub persisted: PersistedStats,
    pub error_rate: f64,
}

// ── Collaborator records ─────────────────────────────────────────────────────

/// One record per query/execute call, success or failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogEntry {
    pub id: String,
    pub connector_id: String,
    pub organization_id: String,
    /// e.g. `"query:read"`, `"execute:create"`.
    pub operation: String,
    pub resource: String,
    pub duration_ms: u64,
    pub row_count: Option<u64>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConnectorCreated,
    ConnectorUpdated,
    ConnectorDeleted,
    ConnectorTested,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ConnectorCreated => "connector_created",
            AuditAction::ConnectorUpdated => "connector_updated",
            AuditAction::ConnectorDeleted => "connector_deleted",
            AuditAction::ConnectorTested => "connector_tested",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub organization_id: String,
    pub connector_id: String,
    pub action: AuditAction,
    /// Never contains credential values.
    pub details: Value,
    pub created_at: DateTime<Utc>,
}
