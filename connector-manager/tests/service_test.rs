// End-to-end tests for ConnectorService over real adapters.
//
// Database connectors run against SQLite files in a temp dir; API connectors
// run against a mockito server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit::config::ConduitConfig;
use conduit::credentials::{SecretVault, KEY_SIZE};
use conduit::rate_limit::{RateLimitConfig, RateLimiter};
use connector_manager::schema::Schema;
use connector_manager::types::{ConnectorCredentials, InstanceStats};
use connector_manager::{
    build_connector, Action, ActionResult, AdapterContext, Capability, Connector, ConnectorConfig,
    ConnectorError, ConnectorFactory, ConnectorService, ConnectorStatus, ConnectorStore,
    ConnectorType, ConnectorUpdate, ErrorKind, HealthStatus, MemoryConnectorStore, NewConnector,
    QueryParams, QueryResult, Result, SortDirection, SqliteConnectorStore, TestResult,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn context() -> AdapterContext {
    let mut settings = ConduitConfig::default();
    settings.retry.base_delay_ms = 1;
    settings.retry.max_delay_ms = 5;
    settings.http.request_timeout_secs = 5;
    AdapterContext::new(
        Arc::new(SecretVault::from_key([3u8; KEY_SIZE]).unwrap()),
        Arc::new(RateLimiter::new()),
        Arc::new(settings),
    )
}

/// SQLite database seeded with a `contacts` table.
fn seeded_database(dir: &TempDir) -> String {
    let path = dir.path().join("crm.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE contacts (
             id INTEGER PRIMARY KEY,
             account_id INTEGER REFERENCES accounts(id),
             name TEXT NOT NULL,
             email TEXT,
             score INTEGER NOT NULL DEFAULT 0
         );
         INSERT INTO accounts (id, name) VALUES (1, 'Acme');
         INSERT INTO contacts (id, account_id, name, email, score) VALUES
             (1, 1, 'Ada', 'ada@example.com', 90),
             (2, 1, 'Grace', 'grace@example.com', 75),
             (3, NULL, 'Linus', NULL, 60);",
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

fn sqlite_connector(name: &str, db_path: &str) -> NewConnector {
    NewConnector::new(name, ConnectorType::Database)
        .with_provider("sqlite")
        .with_credential("filename", json!(db_path))
}

fn predicate(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ── Lifecycle counting ──────────────────────────────────────────────────────

/// Wraps a real adapter and counts `initialize` calls.
struct Counted {
    inner: Arc<dyn Connector>,
    initializations: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for Counted {
    fn connector_type(&self) -> ConnectorType {
        self.inner.connector_type()
    }

    fn connector_id(&self) -> &str {
        self.inner.connector_id()
    }

    async fn initialize(&self, config: &ConnectorConfig) -> Result<()> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        self.inner.initialize(config).await
    }

    async fn dispose(&self) -> Result<()> {
        self.inner.dispose().await
    }

    async fn is_initialized(&self) -> bool {
        self.inner.is_initialized().await
    }

    async fn test(&self) -> Result<TestResult> {
        self.inner.test().await
    }

    async fn query(&self, params: &QueryParams) -> Result<QueryResult> {
        self.inner.query(params).await
    }

    async fn execute(&self, action: &Action) -> Result<ActionResult> {
        self.inner.execute(action).await
    }

    async fn execute_transaction(&self, actions: &[Action]) -> Result<Vec<ActionResult>> {
        self.inner.execute_transaction(actions).await
    }

    async fn get_schema(&self) -> Result<Schema> {
        self.inner.get_schema().await
    }

    async fn health_status(&self) -> HealthStatus {
        self.inner.health_status().await
    }

    fn stats(&self) -> InstanceStats {
        self.inner.stats()
    }
}

#[derive(Default)]
struct CountingFactory {
    initializations: Arc<AtomicU64>,
}

impl ConnectorFactory for CountingFactory {
    fn build(&self, config: &ConnectorConfig, ctx: AdapterContext) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(Counted {
            inner: build_connector(config, ctx)?,
            initializations: Arc::clone(&self.initializations),
        }))
    }
}

// ── Service over the database adapter ───────────────────────────────────────

#[tokio::test]
async fn test_create_persists_encrypted_credentials_and_activates() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let store_path = dir.path().join("connectors.db");
    let store = Arc::new(SqliteConnectorStore::new(store_path.to_str().unwrap()).unwrap());
    let ctx = context();
    let vault = Arc::clone(&ctx.vault);
    let service = ConnectorService::new(store.clone(), ctx);

    let created = service
        .create_connector("org-1", sqlite_connector("CRM Replica", &db_path))
        .await
        .unwrap();
    assert_eq!(created.slug, "crm-replica");
    assert_eq!(created.status, ConnectorStatus::Active);
    assert!(created.last_tested_at.is_some());
    assert!(created.last_error.is_none());

    let stored = store.load_config(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ConnectorStatus::Active);
    let ConnectorCredentials::Encrypted(blob) = &stored.credentials else {
        panic!("credentials stored in plaintext");
    };
    assert!(!blob.contains("crm.db"));
    let opened: Value = vault.decrypt_structured(blob).unwrap();
    assert_eq!(opened["filename"], json!(db_path));

    assert_eq!(
        store.audit_actions(&created.id).unwrap(),
        vec!["connector_created", "connector_tested"]
    );
    service.dispose_all().await;
}

#[tokio::test]
async fn test_database_query_and_actions_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let store = Arc::new(MemoryConnectorStore::new());
    let service = ConnectorService::new(store.clone(), context());
    let id = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap()
        .id;

    // Filter, sort, paginate
    let page = service
        .query_connector(
            &id,
            &QueryParams::read("contacts")
                .with_filter("account_id", json!(1))
                .with_sort("score", SortDirection::Desc)
                .with_fields(&["id", "name"])
                .with_limit(1),
        )
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0]["name"], json!("Ada"));
    assert!(page.rows[0].get("email").is_none());
    assert_eq!(page.metadata.total, Some(2));
    assert!(page.metadata.has_more);

    let nulls = service
        .query_connector(&id, &QueryParams::read("contacts").with_filter("email", Value::Null))
        .await
        .unwrap();
    assert_eq!(nulls.rows.len(), 1);
    assert_eq!(nulls.rows[0]["name"], json!("Linus"));

    let found = service
        .query_connector(&id, &QueryParams::search("contacts", "grace", &["name", "email"]))
        .await
        .unwrap();
    assert_eq!(found.rows.len(), 1);

    // Create, update, delete
    let created = service
        .execute_action(&id, &Action::create("contacts", json!({"name": "Barbara", "score": 88})))
        .await
        .unwrap();
    assert!(created.success);
    assert_eq!(created.affected_rows, 1);
    assert_eq!(created.rows[0]["name"], json!("Barbara"));
    let new_id = created.rows[0]["id"].clone();

    let updated = service
        .execute_action(
            &id,
            &Action::update("contacts", json!({"score": 99}), predicate(json!({"id": new_id}))),
        )
        .await
        .unwrap();
    assert_eq!(updated.affected_rows, 1);
    assert_eq!(updated.rows[0]["score"], json!(99));

    let deleted = service
        .execute_action(&id, &Action::delete("contacts", predicate(json!({"score": {"$lt": 70}}))))
        .await
        .unwrap();
    assert_eq!(deleted.affected_rows, 1);

    // Delete without a predicate never reaches the database
    let err = service
        .execute_action(&id, &Action::delete("contacts", Map::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Validation(_)));

    // Every data call produced a query log record
    let log = store.query_log();
    assert_eq!(log.len(), 7);
    assert_eq!(log[3].operation, "execute:create");
    assert_eq!(log[6].error_kind, Some(ErrorKind::ValidationError));

    let stats = service.get_connector_stats(&id).await.unwrap();
    assert_eq!(stats.persisted.request_count, 7);
    assert_eq!(stats.persisted.error_count, 1);
    assert!(stats.cached);
    service.dispose_all().await;
}

#[tokio::test]
async fn test_database_transaction_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let id = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap()
        .id;

    let results = service
        .execute_transaction(
            &id,
            &[
                Action::create("accounts", json!({"id": 2, "name": "Globex"})),
                Action::create("contacts", json!({"name": "Hank", "account_id": 2})),
            ],
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);

    // Second statement violates NOT NULL, so the first is rolled back too
    let err = service
        .execute_transaction(
            &id,
            &[
                Action::create("accounts", json!({"id": 3, "name": "Initech"})),
                Action::create("contacts", json!({"email": "no-name@example.com"})),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::QueryFailed { .. }));

    let accounts = service
        .query_connector(&id, &QueryParams::read("accounts"))
        .await
        .unwrap();
    assert_eq!(accounts.metadata.total, Some(2));
    service.dispose_all().await;
}

#[tokio::test]
async fn test_database_schema_introspection() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let id = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap()
        .id;

    let schema = service.get_connector_schema(&id).await.unwrap();
    assert!(schema.supports(Capability::Transaction));
    let contacts = schema.resource("contacts").unwrap();
    assert_eq!(contacts.primary_key, vec!["id"]);
    assert_eq!(contacts.relations.len(), 1);
    assert_eq!(contacts.relations[0].target_resource, "accounts");
    let email = contacts.fields.iter().find(|f| f.name == "email").unwrap();
    assert!(email.nullable);
    service.dispose_all().await;
}

#[tokio::test]
async fn test_update_evicts_cached_instance() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let factory = Arc::new(CountingFactory::default());
    let service = ConnectorService::with_factory(
        Arc::new(MemoryConnectorStore::new()),
        context(),
        factory.clone(),
    );
    let id = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap()
        .id;
    service.query_connector(&id, &QueryParams::read("contacts")).await.unwrap();
    assert_eq!(factory.initializations.load(Ordering::SeqCst), 1);

    let mut creds = Map::new();
    creds.insert("filename".into(), json!(db_path));
    let updated = service
        .update_connector(
            &id,
            ConnectorUpdate {
                credentials: Some(creds),
                ..ConnectorUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, ConnectorStatus::Pending);
    assert!(service.registry().get(&id).is_none());

    service.query_connector(&id, &QueryParams::read("contacts")).await.unwrap();
    assert_eq!(factory.initializations.load(Ordering::SeqCst), 2);
    service.dispose_all().await;
}

#[tokio::test]
async fn test_rate_limit_rejects_fourth_call() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let store = Arc::new(MemoryConnectorStore::new());
    let service = ConnectorService::new(store.clone(), context());
    let id = service
        .create_connector(
            "org-1",
            sqlite_connector("crm", &db_path).with_rate_limit(RateLimitConfig::new(3, 1000)),
        )
        .await
        .unwrap()
        .id;

    for _ in 0..3 {
        service.query_connector(&id, &QueryParams::read("contacts")).await.unwrap();
    }
    let err = service
        .query_connector(&id, &QueryParams::read("contacts"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::RateLimitExceeded { .. }));
    assert_eq!(
        store.query_log().last().unwrap().error_kind,
        Some(ErrorKind::RateLimitExceeded)
    );

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    service.query_connector(&id, &QueryParams::read("contacts")).await.unwrap();
    service.dispose_all().await;
}

#[tokio::test]
async fn test_rate_limit_covers_test_and_schema() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let store = Arc::new(MemoryConnectorStore::new());
    let service = ConnectorService::new(store.clone(), context());
    // Creation's own test takes the first slot
    let id = service
        .create_connector(
            "org-1",
            sqlite_connector("crm", &db_path).with_rate_limit(RateLimitConfig::new(2, 60_000)),
        )
        .await
        .unwrap()
        .id;

    service.get_connector_schema(&id).await.unwrap();
    assert!(matches!(
        service.get_connector_schema(&id).await,
        Err(ConnectorError::RateLimitExceeded { .. })
    ));
    assert!(matches!(
        service.test_connector(&id).await,
        Err(ConnectorError::RateLimitExceeded { .. })
    ));

    // A denied test leaves the recorded outcome alone
    let config = service.get_connector(&id).await.unwrap();
    assert_eq!(config.status, ConnectorStatus::Active);
    assert!(config.last_error.is_none());
    service.dispose_all().await;
}

#[tokio::test]
async fn test_zero_request_rate_limit_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());

    let err = service
        .create_connector(
            "org-1",
            sqlite_connector("crm", &db_path).with_rate_limit(RateLimitConfig::new(0, 1000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Validation(_)));
    assert!(service.list_connectors("org-1").await.unwrap().is_empty());

    let id = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap()
        .id;
    let update = ConnectorUpdate {
        rate_limit: Some(RateLimitConfig::new(0, 1000)),
        ..Default::default()
    };
    let err = service.update_connector(&id, update).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Validation(_)));
    assert!(service.get_connector(&id).await.unwrap().rate_limit.is_none());
    service.dispose_all().await;
}

#[tokio::test]
async fn test_failed_initialize_marks_error() {
    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let created = service
        .create_connector(
            "org-1",
            NewConnector::new("Warehouse", ConnectorType::Database).with_provider("postgres"),
        )
        .await
        .unwrap();
    assert_eq!(created.status, ConnectorStatus::Error);
    assert!(created.last_error.unwrap().contains("host"));

    let result = service.test_connector(&created.id).await.unwrap();
    assert!(!result.success);
}

// ── Adapter lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_data_calls_require_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = seeded_database(&dir);
    let ctx = context();
    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), ctx.clone());
    let config = service
        .create_connector("org-1", sqlite_connector("crm", &db_path))
        .await
        .unwrap();
    service.dispose_all().await;

    let instance = build_connector(&config, ctx).unwrap();
    let params = QueryParams::read("contacts");
    assert!(matches!(
        instance.query(&params).await,
        Err(ConnectorError::NotInitialized(_))
    ));

    instance.initialize(&config).await.unwrap();
    assert_eq!(instance.query(&params).await.unwrap().rows.len(), 3);

    instance.dispose().await.unwrap();
    assert!(!instance.is_initialized().await);
    assert!(matches!(
        instance.query(&params).await,
        Err(ConnectorError::NotInitialized(_))
    ));
    assert!(matches!(
        instance.execute(&Action::create("contacts", json!({"name": "x"}))).await,
        Err(ConnectorError::NotInitialized(_))
    ));
    // Idempotent
    instance.dispose().await.unwrap();

    let stats = instance.stats();
    assert_eq!(stats.request_count, 4);
    assert_eq!(stats.error_count, 3);
}

// ── Service over the API adapter ────────────────────────────────────────────

fn oauth_connector(base_url: &str) -> NewConnector {
    NewConnector::new("HubSpot", ConnectorType::Api)
        .with_provider("hubspot")
        .with_option("baseUrl", json!(base_url))
        .with_option("tokenUrl", json!(format!("{}/oauth/token", base_url)))
        .with_option("testEndpoint", json!("/health"))
        .with_credential("accessToken", json!("old"))
        .with_credential("refreshToken", json!("refresh-1"))
        .with_credential("clientId", json!("client"))
        .with_credential("clientSecret", json!("shh"))
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    let health = server
        .mock("GET", "/health")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let token = server
        .mock("POST", "/oauth/token")
        .match_body(mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "new", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;
    let _stale = server
        .mock("GET", "/contacts")
        .match_header("authorization", "Bearer old")
        .with_status(401)
        .create_async()
        .await;
    let fresh = server
        .mock("GET", "/contacts")
        .match_header("authorization", "Bearer new")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-total-count", "1")
        .with_body(r#"{"data": [{"id": 1, "email": "ada@example.com"}]}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let created = service
        .create_connector("org-1", oauth_connector(&server.url()))
        .await
        .unwrap();
    assert_eq!(created.status, ConnectorStatus::Active);
    health.assert_async().await;

    let params = QueryParams::read("contacts");
    let calls = (0..50).map(|_| service.query_connector(&created.id, &params));
    let results = futures::future::join_all(calls).await;

    for result in &results {
        let result = result.as_ref().unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.metadata.total, Some(1));
    }
    token.assert_async().await;
    fresh.assert_async().await;
    service.dispose_all().await;
}

#[tokio::test]
async fn test_failed_refresh_fails_every_waiter() {
    let mut server = mockito::Server::new_async().await;
    let _health = server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;
    let token = server
        .mock("POST", "/oauth/token")
        .with_status(400)
        .with_body(r#"{"error": "invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;
    let _stale = server
        .mock("GET", "/contacts")
        .match_header("authorization", "Bearer old")
        .with_status(401)
        .create_async()
        .await;

    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let id = service
        .create_connector("org-1", oauth_connector(&server.url()))
        .await
        .unwrap()
        .id;

    let params = QueryParams::read("contacts");
    let calls = (0..50).map(|_| service.query_connector(&id, &params));
    let results = futures::future::join_all(calls).await;
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(ConnectorError::InvalidCredentials(_)))));

    // Later failures for the same stale token reuse the outcome
    let again = service.query_connector(&id, &params).await;
    assert!(matches!(again, Err(ConnectorError::InvalidCredentials(_))));
    token.assert_async().await;
    service.dispose_all().await;
}

#[tokio::test]
async fn test_api_actions_and_transactions() {
    let mut server = mockito::Server::new_async().await;
    let _root = server.mock("GET", "/").with_status(200).create_async().await;
    let create = server
        .mock("POST", "/deals")
        .match_header("x-api-key", "key-123")
        .match_body(mockito::Matcher::Json(json!({"amount": 10})))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "d1", "amount": 10}"#)
        .create_async()
        .await;
    let delete = server
        .mock("DELETE", "/deals/d1")
        .with_status(204)
        .create_async()
        .await;

    let service = ConnectorService::new(Arc::new(MemoryConnectorStore::new()), context());
    let id = service
        .create_connector(
            "org-1",
            NewConnector::new("Deals API", ConnectorType::Api)
                .with_option("baseUrl", json!(server.url()))
                .with_credential("apiKey", json!("key-123")),
        )
        .await
        .unwrap()
        .id;

    let created = service
        .execute_action(&id, &Action::create("deals", json!({"amount": 10})))
        .await
        .unwrap();
    assert_eq!(created.rows[0]["id"], json!("d1"));
    assert_eq!(created.affected_rows, 1);

    let deleted = service
        .execute_action(&id, &Action::delete("deals", predicate(json!({"id": "d1"}))))
        .await
        .unwrap();
    assert!(deleted.success);
    // Empty 204 body: nothing echoed back, nothing counted
    assert_eq!(deleted.affected_rows, 0);
    create.assert_async().await;
    delete.assert_async().await;

    let err = service
        .execute_transaction(&id, &[Action::create("deals", json!({"amount": 1}))])
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Validation(_)));

    let schema = service.get_connector_schema(&id).await.unwrap();
    assert!(schema.resources.is_empty());
    assert!(schema.supports(Capability::Read) && schema.supports(Capability::Write));
    service.dispose_all().await;
}
