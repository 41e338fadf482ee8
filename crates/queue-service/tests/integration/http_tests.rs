//! HTTP glue tests against a real server bound to a random port.

use common::identity::TtlOtpStore;
use common::secret::ExposeSecret;
use queue_test_utils::{test_engine, TestQueueServer};
use std::sync::Arc;
use reqwest::StatusCode;
use serde_json::{json, Value};

const ROLE_HEADER: &str = "x-caller-role";
const PHONE_HEADER: &str = "x-operator-phone";
const OTP_HEADER: &str = "x-operator-otp";

struct Api {
    server: TestQueueServer,
    client: reqwest::Client,
}

impl Api {
    async fn spawn() -> Result<Self, anyhow::Error> {
        Ok(Self {
            server: TestQueueServer::spawn(test_engine().await).await?,
            client: reqwest::Client::new(),
        })
    }

    async fn spawn_with_otp(store: Arc<TtlOtpStore>) -> Result<Self, anyhow::Error> {
        Ok(Self {
            server: TestQueueServer::spawn_with_operator_otp(test_engine().await, store).await?,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.url(), path)
    }

    async fn post(&self, path: &str, role: &str, body: Value) -> Result<reqwest::Response, anyhow::Error> {
        Ok(self
            .client
            .post(self.url(path))
            .header(ROLE_HEADER, role)
            .json(&body)
            .send()
            .await?)
    }

    async fn create_clinic(&self, clinic: &str) -> Result<(), anyhow::Error> {
        let response = self
            .post(
                "/api/v1/queues",
                "provider",
                json!({ "owner_ref": clinic, "queue_id": clinic, "kind": "clinic" }),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
        Ok(())
    }
}

#[tokio::test]
async fn test_join_and_call_next_over_http() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;
    api.create_clinic("clinic_1").await?;

    let response = api
        .post(
            "/api/v1/queues/clinic_1/join",
            "patient",
            json!({ "name": "Alice", "contact": "+15550100" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let joined: Value = response.json().await?;
    assert_eq!(joined["entry"]["token"], 1);
    assert_eq!(joined["entry"]["state"], "WAITING");
    assert_eq!(joined["ahead"], 0);
    assert!(joined["entry"].get("contact").is_none());

    let response = api
        .post("/api/v1/queues/clinic_1/join", "patient", json!({ "name": "Bob" }))
        .await?;
    let joined: Value = response.json().await?;
    assert_eq!(joined["entry"]["token"], 2);
    assert_eq!(joined["ahead"], 1);

    let response = api
        .post("/api/v1/queues/clinic_1/call-next", "provider", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let served: Value = response.json().await?;
    assert_eq!(served["serving"]["token"], 1);
    assert_eq!(served["serving"]["contact"], "+15550100");

    let view: Value = api
        .client
        .get(api.url("/api/v1/queues/clinic_1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(view["serving"]["token"], 1);
    assert_eq!(view["waiting"].as_array().map(Vec::len), Some(1));
    assert_eq!(view["status"], "OPEN");

    Ok(())
}

#[tokio::test]
async fn test_call_next_on_empty_queue_is_400() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;
    api.create_clinic("clinic_empty").await?;

    let response = api
        .post("/api/v1/queues/clinic_empty/call-next", "provider", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "QUEUE_EMPTY");

    Ok(())
}

#[tokio::test]
async fn test_role_enforcement() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;
    api.create_clinic("clinic_roles").await?;

    let response = api
        .post("/api/v1/queues/clinic_roles/call-next", "patient", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = api
        .client
        .post(api.url("/api/v1/queues/clinic_roles/join"))
        .json(&json!({ "name": "Ann" }))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = api
        .post("/api/v1/queues/clinic_roles/join", "superuser", json!({ "name": "Ann" }))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Reads stay public.
    let response = api
        .client
        .get(api.url("/api/v1/queues/clinic_roles"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn test_error_statuses() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;
    api.create_clinic("clinic_errors").await?;

    let response = api
        .post("/api/v1/queues/nowhere/join", "patient", json!({ "name": "Ann" }))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = api
        .post("/api/v1/queues/clinic_errors/join", "patient", json!({ "name": "   " }))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .client
        .post(api.url("/api/v1/queues/clinic_errors/join"))
        .header(ROLE_HEADER, "patient")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .post(
            "/api/v1/queues",
            "admin",
            json!({ "owner_ref": "clinic_errors", "queue_id": "clinic_errors", "kind": "clinic" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = api
        .post("/api/v1/queues/clinic_errors/end", "provider", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = api
        .post("/api/v1/queues/clinic_errors/join", "patient", json!({ "name": "Ann" }))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "QUEUE_CLOSED");

    Ok(())
}

#[tokio::test]
async fn test_session_join_by_code_and_remove() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;

    let response = api
        .post(
            "/api/v1/queues",
            "provider",
            json!({ "owner_ref": "dr_grey", "kind": "session", "title": "Walk-ins" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let session: Value = response.json().await?;
    let code = session["join_code"].as_str().unwrap_or_default().to_string();
    assert_eq!(code.len(), 6);
    assert_eq!(session["host_name"], "dr_grey");

    let request = json!({ "join_code": code, "name": "Ann", "idempotency_key": "k1" });
    let response = api.post("/api/v1/sessions/join", "patient", request.clone()).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let joined: Value = response.json().await?;
    let entry_id = joined["entry"]["id"].as_str().unwrap_or_default().to_string();

    let response = api.post("/api/v1/sessions/join", "patient", request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let replay: Value = response.json().await?;
    assert_eq!(replay["replayed"], true);
    assert_eq!(replay["entry"]["id"], entry_id.as_str());

    for expected_change in [true, false] {
        let response = api
            .client
            .delete(api.url(&format!("/api/v1/entries/{entry_id}")))
            .header(ROLE_HEADER, "provider")
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let removed: Value = response.json().await?;
        assert_eq!(removed["changed"], expected_change);
        assert_eq!(removed["entry"]["state"], "REMOVED");
    }

    let queue_id = session["queue_id"].as_str().unwrap_or_default();
    let history: Value = api
        .client
        .get(api.url(&format!("/api/v1/queues/{queue_id}/history")))
        .header(ROLE_HEADER, "patient")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(history["entries"].as_array().map(Vec::len), Some(1));

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_is_served() -> Result<(), anyhow::Error> {
    let api = Api::spawn().await?;
    let response = api.client.get(api.url("/metrics")).send().await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_operator_otp_guards_call_next_and_remove() -> Result<(), anyhow::Error> {
    let store = Arc::new(TtlOtpStore::default());
    let api = Api::spawn_with_otp(Arc::clone(&store)).await?;
    api.create_clinic("clinic_otp").await?;

    let response = api
        .post("/api/v1/queues/clinic_otp/join", "patient", json!({ "name": "Ann" }))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let joined: Value = response.json().await?;
    let entry_id = joined["entry"]["id"].as_str().unwrap_or_default().to_string();

    // Staff without a code never reach the engine.
    let response = api
        .post("/api/v1/queues/clinic_otp/call-next", "provider", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    let response = api
        .client
        .post(api.url("/api/v1/queues/clinic_otp/call-next"))
        .header(ROLE_HEADER, "provider")
        .header(PHONE_HEADER, "+15550123")
        .header(OTP_HEADER, "000000")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Patients are refused by role, not by the code check.
    let response = api
        .post("/api/v1/queues/clinic_otp/call-next", "patient", json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let code = store.issue("+15550123")?;
    let response = api
        .client
        .post(api.url("/api/v1/queues/clinic_otp/call-next"))
        .header(ROLE_HEADER, "provider")
        .header(PHONE_HEADER, "+15550123")
        .header(OTP_HEADER, code.expose_secret())
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let delete = |code: String| {
        api.client
            .delete(api.url(&format!("/api/v1/entries/{entry_id}")))
            .header(ROLE_HEADER, "provider")
            .header(PHONE_HEADER, "+15550123")
            .header(OTP_HEADER, code)
            .send()
    };

    // Each code works once.
    let response = delete(code.expose_secret().to_string()).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let code = store.issue("+15550123")?;
    let response = delete(code.expose_secret().to_string()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let removed: Value = response.json().await?;
    assert_eq!(removed["changed"], true);

    // Joins and reads need no operator code.
    let view: Value = api
        .client
        .get(api.url("/api/v1/queues/clinic_otp"))
        .send()
        .await?
        .json()
        .await?;
    assert!(view["serving"].is_null());
    assert_eq!(view["removed_count"], 1);

    Ok(())
}
