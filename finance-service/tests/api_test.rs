mod common;

use common::{d, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

fn amount(value: &Value) -> rust_decimal::Decimal {
    d(value.as_str().expect("amounts are serialized as strings"))
}

async fn register(app: &TestApp, name: &str) -> Uuid {
    let response = app
        .post("/tenants", json!({ "name": name, "phone": "0712345678" }))
        .await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    body["tenantId"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_and_readiness() {
    let app = TestApp::spawn().await;

    let health = app.get("/health").await;
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "finance-service");

    let ready = app.get("/ready").await;
    assert_eq!(ready.status(), 200);
    let body: Value = ready.json().await.unwrap();
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn metrics_endpoint_is_text() {
    let app = TestApp::spawn().await;
    let response = app.get("/metrics").await;
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/plain")));
}

#[tokio::test]
async fn tenant_pays_rent_through_the_api() {
    let app = TestApp::spawn().await;
    let tenant_id = register(&app, "Wanjiku").await;

    let response = app
        .client
        .put(app.url(&format!("/tenants/{}/unit", tenant_id)))
        .json(&json!({
            "unitId": Uuid::new_v4(),
            "label": "B4",
            "monthlyRent": 18000,
            "issueInvoice": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["tenant"]["unit"]["label"], "B4");
    assert_eq!(body["invoice"]["periodMonth"], 3);
    assert_eq!(amount(&body["invoice"]["amountDue"]), d("18000"));

    let summary: Value = app
        .get(&format!("/tenants/{}/summary", tenant_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(summary["status"], "Overdue");
    assert_eq!(summary["period"], "2026-03");
    assert_eq!(amount(&summary["balanceNow"]), d("18000"));

    let response = app
        .post(
            "/payments",
            json!({
                "tenantId": tenant_id,
                "amount": "18000",
                "method": "mpesa",
                "txId": "QK12ABC",
                "msisdn": "0712345678"
            }),
        )
        .await;
    assert_eq!(response.status(), 201);
    let payment: Value = response.json().await.unwrap();
    assert_eq!(payment["externalTxId"], "QK12ABC");
    assert_eq!(payment["status"], "paid");

    let summary: Value = app
        .get(&format!("/tenants/{}/summary", tenant_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(summary["status"], "Cleared");
    assert_eq!(amount(&summary["amountPaidMtd"]), d("18000"));

    let invoice: Value = app
        .get(&format!("/tenants/{}/invoices/active", tenant_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(invoice["status"], "paid");

    let history: Vec<Value> = app
        .get(&format!("/tenants/{}/finance-history", tenant_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["type"], "payment");
    assert_eq!(amount(&history[0]["runningBalance"]), d("0"));
    assert_eq!(history[1]["type"], "charge");
    assert_eq!(amount(&history[1]["runningBalance"]), d("18000"));
}

#[tokio::test]
async fn all_summaries_lists_registered_tenants() {
    let app = TestApp::spawn().await;
    register(&app, "Moraa").await;
    register(&app, "Ouma").await;

    let summaries: Vec<Value> = app.get("/tenants/summary").await.json().await.unwrap();
    assert_eq!(summaries.len(), 2);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let app = TestApp::spawn().await;
    let tenant_id = register(&app, "Kilonzo").await;

    let blank = app.post("/tenants", json!({ "name": "" })).await;
    assert_eq!(blank.status(), 422);

    let zero = app
        .post("/payments", json!({ "tenantId": tenant_id, "amount": 0 }))
        .await;
    assert_eq!(zero.status(), 422);

    let month = app
        .post(
            "/ledger/invoices",
            json!({ "tenantId": tenant_id, "periodYear": 2026, "periodMonth": 13, "amountDue": 100 }),
        )
        .await;
    assert_eq!(month.status(), 422);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let app = TestApp::spawn().await;
    let missing = Uuid::new_v4();

    let summary = app.get(&format!("/tenants/{}/summary", missing)).await;
    assert_eq!(summary.status(), 404);

    let tenant_id = register(&app, "Nyambura").await;
    let invoice = app
        .get(&format!("/tenants/{}/invoices/active", tenant_id))
        .await;
    assert_eq!(invoice.status(), 404);

    let provider = app
        .post(
            "/payments/paypal/initiate",
            json!({ "tenantId": tenant_id, "amount": 100 }),
        )
        .await;
    assert_eq!(provider.status(), 404);

    let status = app
        .get(&format!("/payments/manual/status/{}", missing))
        .await;
    assert_eq!(status.status(), 404);
}

#[tokio::test]
async fn unconfigured_provider_is_unavailable() {
    let app = TestApp::spawn().await;
    let tenant_id = register(&app, "Jeptoo").await;

    let response = app
        .post(
            "/payments/kcb/initiate",
            json!({ "tenantId": tenant_id, "amount": 100 }),
        )
        .await;
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn manual_payment_is_recorded_immediately() {
    let app = TestApp::spawn().await;
    let tenant_id = register(&app, "Mutua").await;

    let response = app
        .post(
            "/payments/manual/initiate",
            json!({ "tenantId": tenant_id, "amount": "2500.50", "narrative": "Counter" }),
        )
        .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "paid");
    let payment_id = body["paymentId"].as_str().unwrap().to_string();

    let status: Value = app
        .get(&format!("/payments/manual/status/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "paid");
    assert!(status["ledgerPaymentId"].is_string());

    let summary = app.ledger.summary(tenant_id).await.unwrap();
    assert_eq!(summary.amount_paid_mtd, d("2500.50"));

    let cancel = app
        .post(&format!("/payments/manual/cancel/{}", payment_id), json!({}))
        .await;
    assert_eq!(cancel.status(), 409);
}

#[tokio::test]
async fn callbacks_need_a_provider_that_sends_them() {
    let app = TestApp::spawn().await;
    let response = app
        .post(
            "/payments/manual/callback",
            json!({ "Body": { "stkCallback": {} } }),
        )
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn pending_payment_is_settled_over_http() {
    let app = TestApp::spawn().await;
    let tenant_id = register(&app, "Akinyi").await;

    let payment: Value = app
        .post(
            "/payments",
            json!({
                "tenantId": tenant_id,
                "amount": 5000,
                "method": "bank",
                "status": "pending"
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let payment_id = payment["paymentId"].as_str().unwrap();

    let response = app
        .client
        .patch(app.url(&format!("/ledger/payments/{}", payment_id)))
        .json(&json!({ "status": "paid", "notes": "Cleared by bank" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let settled: Value = response.json().await.unwrap();
    assert_eq!(settled["status"], "paid");

    let summary = app.ledger.summary(tenant_id).await.unwrap();
    assert_eq!(summary.balance_now, d("-5000"));
}
