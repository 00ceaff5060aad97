//! End-to-end tests: real SQLite database, dummy model provider, HTTP over a loopback socket.

use std::sync::Arc;

use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::TempDir;

use scrollgate_internal::config_parser::Config;
use scrollgate_internal::gateway_util::{build_router, AppStateData};

struct TestGateway {
    base_url: String,
    client: reqwest::Client,
    _dir: TempDir,
}

impl TestGateway {
    async fn start(extra_toml: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("scrollgate.db");
        let toml = format!(
            "[storage]\ndatabase_path = {:?}\n\n[llm]\nprovider = \"dummy\"\ndefault_model = \"dummy\"\n\n{extra_toml}",
            db_path.display().to_string()
        );
        let mut config = Config::load_from_toml(&toml)?;
        config.gateway.admin_api_key = Some(SecretString::from("admin-key".to_string()));
        config.validate()?;

        let state = AppStateData::new(Arc::new(config)).await?;
        let router = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });

        Ok(Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            _dir: dir,
        })
    }

    async fn chat(&self, user_id: &str, text: &str) -> anyhow::Result<(StatusCode, Value)> {
        let response = self
            .client
            .post(format!("{}/chat", self.base_url))
            .json(&json!({ "userId": user_id, "text": text }))
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn get(&self, path: &str) -> anyhow::Result<(StatusCode, Value)> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn reset_month(&self) -> anyhow::Result<(StatusCode, Value)> {
        let response = self
            .client
            .post(format!("{}/admin/usage/reset", self.base_url))
            .bearer_auth("admin-key")
            .json(&json!({}))
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }
}

#[tokio::test]
async fn test_chat_usage_is_persisted() -> anyhow::Result<()> {
    let gateway = TestGateway::start("").await?;

    let (status, first) = gateway.chat("alice", "hello gateway").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["output"], "echo: hello gateway");
    let (status, second) = gateway.chat("alice", "and again").await?;
    assert_eq!(status, StatusCode::OK);

    let tokens = first["tokensUsed"].as_u64().unwrap_or_default()
        + second["tokensUsed"].as_u64().unwrap_or_default();
    let (status, usage) = gateway.get("/usage/alice").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["tokens_used"], tokens);
    assert_eq!(usage["sessions_this_month"], 2);
    assert_eq!(usage["remaining_tokens"], 650_000 - tokens);

    let (status, snapshot) = gateway.get("/sessions/alice/snapshot").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["counters"]["total_sessions"], 2);
    assert_eq!(snapshot["recent_sessions"][0]["text"], "and again");
    Ok(())
}

#[tokio::test]
async fn test_budget_blocks_until_reset() -> anyhow::Result<()> {
    let gateway = TestGateway::start("[usage_limits]\nmonthly_token_cap = 160").await?;

    // First request of the month is always admitted
    let (status, _) = gateway.chat("bob", "hello").await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = gateway.chat("bob", "hello").await?;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "monthly_token_limit");

    // Sticky
    let (status, _) = gateway.chat("bob", "hi").await?;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let (_, usage) = gateway.get("/usage/bob").await?;
    assert_eq!(usage["is_blocked"], true);

    let (status, reset) = gateway.reset_month().await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["records_reset"], 1);

    let (status, _) = gateway.chat("bob", "hello").await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_high_cost_burst_is_rejected() -> anyhow::Result<()> {
    let gateway = TestGateway::start("").await?;

    for _ in 0..5 {
        let (status, _) = gateway.chat("carol", "quick").await?;
        assert_eq!(status, StatusCode::OK);
    }
    let response = gateway
        .client
        .post(format!("{}/chat", gateway.base_url))
        .json(&json!({ "userId": "carol", "text": "quick" }))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.headers()["x-ratelimit-limit"], "30");

    // Other users are unaffected
    let (status, _) = gateway.chat("dave", "quick").await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_health_checks_sqlite() -> anyhow::Result<()> {
    let gateway = TestGateway::start("").await?;

    let (status, health) = gateway.get("/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["store"], "ok");

    let (status, body) = gateway.get("/status").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "sqlite");
    Ok(())
}
