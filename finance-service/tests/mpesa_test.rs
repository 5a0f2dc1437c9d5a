mod common;

use common::{d, TestApp};
use finance_service::config::MpesaConfig;
use finance_service::error::GatewayError;
use finance_service::services::gateway::{
    ChargeRequest, Delivery, GatewayRegistry, GatewayStatus, MpesaGateway, PaymentGateway,
    PollPolicy, ProviderCallback,
};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHECKOUT_ID: &str = "ws_CO_10032026090000123456";
const CALLBACK_TOKEN: &str = "cb-7f3e9a";

fn config(base_url: &str) -> MpesaConfig {
    MpesaConfig {
        base_url: base_url.to_string(),
        consumer_key: Secret::new("consumer-key".to_string()),
        consumer_secret: Secret::new("consumer-secret".to_string()),
        short_code: "174379".to_string(),
        pass_key: Secret::new("passkey".to_string()),
        callback_url: "https://rent.example.com/payments/mpesa/callback".to_string(),
        callback_token: Some(Secret::new(CALLBACK_TOKEN.to_string())),
        callback_retention: Duration::from_secs(3600),
        account_reference: "RENT".to_string(),
        transaction_type: "CustomerPayBillOnline".to_string(),
        min_amount: Decimal::ONE,
        poll: PollPolicy {
            interval: Duration::from_millis(50),
            max_polls: 100,
            ceiling: Duration::from_secs(10),
        },
    }
}

fn charge(amount: &str) -> ChargeRequest {
    ChargeRequest {
        reference: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        amount: d(amount),
        phone: Some("0712 345 678".to_string()),
        narrative: Some("March rent".to_string()),
    }
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .and(query_param("grant_type", "client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-token",
            "expires_in": "3599"
        })))
        .mount(server)
        .await;
}

async fn mount_push_accepted(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": CHECKOUT_ID,
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .mount(server)
        .await;
}

async fn mount_query(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpushquery/v1/query"))
        .respond_with(response)
        .mount(server)
        .await;
}

fn still_processing() -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_json(json!({
        "requestId": "1234-5678",
        "errorCode": "500.001.1001",
        "errorMessage": "The transaction is being processed"
    }))
}

fn query_result(code: &str, desc: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "ResponseCode": "0",
        "CheckoutRequestID": CHECKOUT_ID,
        "ResultCode": code,
        "ResultDesc": desc
    }))
}

fn paid_callback(receipt: &str, amount: u64) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": CHECKOUT_ID,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "TransactionDate", "Value": 20260310090512u64 },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

#[tokio::test]
async fn stk_push_returns_checkout_request_id() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .and(body_partial_json(json!({
            "BusinessShortCode": "174379",
            "Amount": 1500,
            "PartyA": "254712345678",
            "PhoneNumber": "254712345678",
            "AccountReference": "RENT",
            "TransactionDesc": "March rent",
            "CallBackURL": "https://rent.example.com/payments/mpesa/callback?token=cb-7f3e9a"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "CheckoutRequestID": CHECKOUT_ID,
            "ResponseCode": "0",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    let handle = gateway.initiate(&charge("1500")).await.unwrap();

    assert_eq!(handle.payment_handle, CHECKOUT_ID);
    assert_eq!(handle.status, GatewayStatus::Pending);
    assert_eq!(handle.phone.as_deref(), Some("254712345678"));
}

#[tokio::test]
async fn token_is_reused_between_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-token",
            "expires_in": "3599"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_push_accepted(&server).await;
    mount_query(&server, still_processing()).await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    gateway.initiate(&charge("100")).await.unwrap();
    gateway.check_status(CHECKOUT_ID).await.unwrap();
}

#[tokio::test]
async fn fractional_amount_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    let gateway = MpesaGateway::new(config(&server.uri()));

    let err = gateway.initiate(&charge("100.50")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Rejected { .. }));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn server_error_on_push_is_unavailable() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    let err = gateway.initiate(&charge("100")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn rejected_push_is_not_transient() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "requestId": "1234-5678",
            "errorCode": "400.002.02",
            "errorMessage": "Bad Request - Invalid PhoneNumber"
        })))
        .mount(&server)
        .await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    let err = gateway.initiate(&charge("100")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Rejected { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn query_still_processing_is_pending() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_query(&server, still_processing()).await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    let report = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(report.status, GatewayStatus::Pending);
}

async fn register_tenant(app: &TestApp) -> Uuid {
    let tenant: Value = app
        .post("/tenants", json!({ "name": "Wekesa", "phone": "0712345678" }))
        .await
        .json()
        .await
        .unwrap();
    tenant["tenantId"].as_str().unwrap().parse().unwrap()
}

async fn initiate_over_http(app: &TestApp, tenant_id: Uuid, amount: u64) -> String {
    let response = app
        .post(
            "/payments/mpesa/initiate",
            json!({ "tenantId": tenant_id, "amount": amount }),
        )
        .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["paymentHandle"], CHECKOUT_ID);
    body["paymentId"].as_str().unwrap().to_string()
}

async fn status_after_polling(app: &TestApp, payment_id: &str) -> Value {
    let mut status = Value::Null;
    for _ in 0..100 {
        status = app
            .get(&format!("/payments/mpesa/status/{}", payment_id))
            .await
            .json()
            .await
            .unwrap();
        if status["status"] != "pending" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    status
}

fn callback_path(token: &str) -> String {
    format!("/payments/mpesa/callback?token={}", token)
}

#[tokio::test]
async fn query_result_zero_is_paid_and_remembered() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpushquery/v1/query"))
        .respond_with(query_result(
            "0",
            "The service request is processed successfully.",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    gateway.initiate(&charge("100")).await.unwrap();
    let first = gateway.check_status(CHECKOUT_ID).await.unwrap();
    let second = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(first.status, GatewayStatus::Paid);
    assert_eq!(first, second);
}

#[tokio::test]
async fn query_cancelled_by_user_is_failed() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_query(&server, query_result("1032", "Request cancelled by user")).await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    let report = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(report.status, GatewayStatus::Failed);
    assert_eq!(report.notes.as_deref(), Some("Request cancelled by user"));
}

#[tokio::test]
async fn paid_callback_waits_for_query_confirmation() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    mount_query(&server, still_processing()).await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    gateway.initiate(&charge("100")).await.unwrap();
    let callback = ProviderCallback::parse_stk(&paid_callback("QCA1B2C3D4", 100)).unwrap();
    assert_eq!(gateway.callbacks().unwrap().deliver(callback), Delivery::Accepted);

    let report = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(report.status, GatewayStatus::Pending);

    server.reset().await;
    mount_token(&server).await;
    mount_query(
        &server,
        query_result("0", "The service request is processed successfully."),
    )
    .await;

    let report = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(report.status, GatewayStatus::Paid);
    assert_eq!(report.receipt.as_deref(), Some("QCA1B2C3D4"));
    assert_eq!(report.amount, Some(d("100")));
}

#[tokio::test]
async fn query_overrides_a_contradicting_callback() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    mount_query(&server, query_result("1032", "Request cancelled by user")).await;

    let gateway = MpesaGateway::new(config(&server.uri()));
    gateway.initiate(&charge("100")).await.unwrap();
    let callback = ProviderCallback::parse_stk(&paid_callback("QCA1B2C3D4", 100)).unwrap();
    gateway.callbacks().unwrap().deliver(callback);

    let report = gateway.check_status(CHECKOUT_ID).await.unwrap();
    assert_eq!(report.status, GatewayStatus::Failed);
    assert!(report.receipt.is_none());
}

#[tokio::test]
async fn stk_payment_is_reconciled_through_the_callback() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    mount_query(&server, still_processing()).await;

    let gateways = GatewayRegistry::new().with(Arc::new(MpesaGateway::new(config(&server.uri()))));
    let app = TestApp::spawn_with(gateways).await;
    let tenant_id = register_tenant(&app).await;
    let payment_id = initiate_over_http(&app, tenant_id, 100).await;

    let ack: Value = app
        .post(&callback_path(CALLBACK_TOKEN), paid_callback("QCA1B2C3D4", 100))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ack["ResultCode"], 0);

    // Daraja has not confirmed yet, so the pushed result alone settles nothing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status: Value = app
        .get(&format!("/payments/mpesa/status/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "pending");
    assert!(app.ledger.list_history(tenant_id, None, None).await.unwrap().is_empty());

    server.reset().await;
    mount_token(&server).await;
    mount_query(
        &server,
        query_result("0", "The service request is processed successfully."),
    )
    .await;

    let status = status_after_polling(&app, &payment_id).await;
    assert_eq!(status["status"], "paid");
    assert_eq!(status["receipt"], "QCA1B2C3D4");

    let summary = app.ledger.summary(tenant_id).await.unwrap();
    assert_eq!(summary.amount_paid_mtd, d("100"));

    let history = app.ledger.list_history(tenant_id, None, None).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn callbacks_without_the_token_are_unauthorized() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    mount_query(
        &server,
        query_result("0", "The service request is processed successfully."),
    )
    .await;

    let gateway = Arc::new(MpesaGateway::new(config(&server.uri())));
    let gateways = GatewayRegistry::new().with(gateway.clone());
    let app = TestApp::spawn_with(gateways).await;
    let tenant_id = register_tenant(&app).await;
    let payment_id = initiate_over_http(&app, tenant_id, 100).await;

    let forged = paid_callback("FAKE000001", 100);
    let missing = app.post("/payments/mpesa/callback", forged.clone()).await;
    assert_eq!(missing.status(), 401);
    let wrong = app.post(&callback_path("cb-7f3e9b"), forged).await;
    assert_eq!(wrong.status(), 401);
    assert!(gateway.callbacks().unwrap().pushed(CHECKOUT_ID).is_none());

    let status = status_after_polling(&app, &payment_id).await;
    assert_eq!(status["status"], "paid");
    assert!(status.get("receipt").is_none());
}

#[tokio::test]
async fn short_paid_callback_is_not_recorded() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_push_accepted(&server).await;
    mount_query(&server, still_processing()).await;

    let gateways = GatewayRegistry::new().with(Arc::new(MpesaGateway::new(config(&server.uri()))));
    let app = TestApp::spawn_with(gateways).await;
    let tenant_id = register_tenant(&app).await;
    let payment_id = initiate_over_http(&app, tenant_id, 100).await;

    let ack = app
        .post(&callback_path(CALLBACK_TOKEN), paid_callback("QCA1B2C3D4", 1))
        .await;
    assert_eq!(ack.status(), 200);

    server.reset().await;
    mount_token(&server).await;
    mount_query(
        &server,
        query_result("0", "The service request is processed successfully."),
    )
    .await;

    let status = status_after_polling(&app, &payment_id).await;
    assert_eq!(status["status"], "timeout");
    assert!(status["notes"].as_str().unwrap().contains("reconcile manually"));
    assert!(status.get("ledgerPaymentId").is_none());
    assert!(app.ledger.list_history(tenant_id, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn callback_for_unknown_handle_is_not_found() {
    let server = MockServer::start().await;
    let gateway = Arc::new(MpesaGateway::new(config(&server.uri())));
    let app = TestApp::spawn_with(GatewayRegistry::new().with(gateway.clone())).await;

    let response = app
        .post(&callback_path(CALLBACK_TOKEN), paid_callback("QCA1B2C3D4", 100))
        .await;
    assert_eq!(response.status(), 404);
    assert!(gateway.callbacks().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_callback_is_bad_request() {
    let server = MockServer::start().await;
    let gateways = GatewayRegistry::new().with(Arc::new(MpesaGateway::new(config(&server.uri()))));
    let app = TestApp::spawn_with(gateways).await;

    let response = app
        .post(&callback_path(CALLBACK_TOKEN), json!({ "unexpected": true }))
        .await;
    assert_eq!(response.status(), 400);
}
