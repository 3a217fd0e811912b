//! Gateway webhook handling over HTTP: authenticity, idempotency and the
//! stock race between two paid checkouts.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{paid_session_event, response_json, TestApp, WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use anime_store_api::entities::pending_payment::PendingPaymentStatus;
use anime_store_api::events::Event;
use anime_store_api::gateway::sign_payload;
use anime_store_api::services::expiry::ExpirySweeper;

/// Starts a checkout and returns (session_id, pending_payment_id)
async fn checkout(app: &TestApp, buyer: Uuid, product: Uuid, quantity: i32) -> (String, String) {
    let (status, body) = app
        .start_checkout(buyer, json!([{ "product_id": product, "quantity": quantity }]))
        .await;
    assert_eq!(status, 201, "checkout failed: {body}");
    (
        body["session_id"].as_str().unwrap().to_string(),
        body["pending_payment_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn duplicate_deliveries_create_one_order() {
    let app = TestApp::new().await;
    let figure = app.seed_product("Rem figure", dec!(80.00), 4).await;
    let (session_id, pending_id) = checkout(&app, Uuid::new_v4(), figure, 2).await;
    let event = paid_session_event(&session_id, &pending_id);

    let first = app.post_webhook(&event).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(response_json(first).await["outcome"], "order_created");

    for _ in 0..4 {
        let again = app.post_webhook(&event).await;
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(response_json(again).await["outcome"], "already_processed");
    }

    assert_eq!(app.orders().await.len(), 1);
    assert_eq!(app.stock_of(figure).await, (2, 2));
}

#[tokio::test]
async fn async_payment_success_also_confirms() {
    let app = TestApp::new().await;
    let artbook = app.seed_product("Ghibli artbook", dec!(35.00), 2).await;
    let (session_id, pending_id) = checkout(&app, Uuid::new_v4(), artbook, 1).await;

    let mut event = paid_session_event(&session_id, &pending_id);
    event["type"] = json!("checkout.session.async_payment_succeeded");
    let response = app.post_webhook(&event).await;
    assert_eq!(response_json(response).await["outcome"], "order_created");
    assert_eq!(app.stock_of(artbook).await, (1, 1));
}

#[tokio::test]
async fn last_unit_goes_to_exactly_one_buyer() {
    let app = TestApp::file_backed().await;
    let rare = app.seed_product("Signed Berserk print", dec!(300.00), 1).await;
    let (session_a, pending_a) = checkout(&app, Uuid::new_v4(), rare, 1).await;
    let (session_b, pending_b) = checkout(&app, Uuid::new_v4(), rare, 1).await;

    let event_a = paid_session_event(&session_a, &pending_a);
    let event_b = paid_session_event(&session_b, &pending_b);
    let (resp_a, resp_b) = tokio::join!(app.post_webhook(&event_a), app.post_webhook(&event_b));
    assert_eq!(resp_a.status(), StatusCode::OK);
    assert_eq!(resp_b.status(), StatusCode::OK);

    let mut outcomes = vec![
        response_json(resp_a).await["outcome"].as_str().unwrap().to_string(),
        response_json(resp_b).await["outcome"].as_str().unwrap().to_string(),
    ];
    outcomes.sort();
    assert_eq!(outcomes, vec!["order_created", "stock_unavailable"]);

    assert_eq!(app.orders().await.len(), 1);
    assert_eq!(app.stock_of(rare).await, (0, 1));

    let statuses = [
        app.pending_payment(pending_a.parse().unwrap()).await,
        app.pending_payment(pending_b.parse().unwrap()).await,
    ];
    let failed: Vec<_> = statuses
        .iter()
        .filter(|p| p.status == PendingPaymentStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_reason.as_deref(), Some("insufficient_stock"));
}

#[tokio::test]
async fn tampered_or_unsigned_bodies_are_rejected() {
    let app = TestApp::new().await;
    let figure = app.seed_product("Miku figure", dec!(45.00), 3).await;
    let (session_id, pending_id) = checkout(&app, Uuid::new_v4(), figure, 1).await;

    let body = serde_json::to_vec(&paid_session_event(&session_id, &pending_id)).unwrap();
    let signature = sign_payload(WEBHOOK_SECRET, Utc::now().timestamp(), &body);
    let mut tampered = body.clone();
    let pos = tampered.len() - 2;
    tampered.insert(pos, b' ');

    let response = app.post_webhook_raw(tampered, Some(signature)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.post_webhook_raw(body.clone(), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stale = sign_payload(WEBHOOK_SECRET, Utc::now().timestamp() - 3600, &body);
    let response = app.post_webhook_raw(body, Some(stale)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(app.orders().await.is_empty());
    assert_eq!(app.stock_of(figure).await, (3, 0));
    let pending = app.pending_payment(pending_id.parse().unwrap()).await;
    assert_eq!(pending.status, PendingPaymentStatus::Initiated);
}

#[tokio::test]
async fn signed_garbage_is_a_bad_request() {
    let app = TestApp::new().await;
    let body = b"{\"id\": \"evt_1\"".to_vec();
    let signature = sign_payload(WEBHOOK_SECRET, Utc::now().timestamp(), &body);
    let response = app.post_webhook_raw(body, Some(signature)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unrelated_events_are_acknowledged() {
    let app = TestApp::new().await;
    let event = json!({
        "id": "evt_refund",
        "type": "charge.refunded",
        "data": {"object": {"id": "ch_1"}}
    });
    let response = app.post_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "ignored");
    assert_eq!(body["event_type"], "charge.refunded");
}

#[tokio::test]
async fn payment_for_an_expired_checkout_raises_alert_and_creates_no_order() {
    let app = TestApp::new().await;
    let figure = app.seed_product("Levi figure", dec!(70.00), 3).await;
    let (session_id, pending_id) = checkout(&app, Uuid::new_v4(), figure, 1).await;

    let sweeper = ExpirySweeper::new(app.db.clone(), app.state.event_sender.clone());
    let expired = sweeper
        .sweep_once(Utc::now() + chrono::Duration::days(2))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let response = app
        .post_webhook(&paid_session_event(&session_id, &pending_id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "checkout_closed");
    assert_eq!(body["pending_payment_id"], pending_id.as_str());

    let alert = app
        .wait_for_event(|e| matches!(e, Event::PaymentCapturedForClosedCheckout { .. }))
        .await;
    match alert {
        Event::PaymentCapturedForClosedCheckout {
            pending_payment_id,
            session_reference,
            status,
            total_amount,
            ..
        } => {
            assert_eq!(pending_payment_id.to_string(), pending_id);
            assert_eq!(session_reference, session_id);
            assert_eq!(status, PendingPaymentStatus::Expired);
            assert_eq!(total_amount, dec!(70.00));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let pending = app.pending_payment(pending_id.parse().unwrap()).await;
    assert_eq!(pending.status, PendingPaymentStatus::Expired);
    assert_eq!(pending.failure_reason.as_deref(), Some("paid_after_checkout_closed"));
    assert!(app.orders().await.is_empty());
    assert_eq!(app.stock_of(figure).await, (3, 0));

    // redelivery neither alerts again nor creates an order
    let response = app
        .post_webhook(&paid_session_event(&session_id, &pending_id))
        .await;
    assert_eq!(response_json(response).await["outcome"], "already_processed");
    let alerts = app
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::PaymentCapturedForClosedCheckout { .. }))
        .count();
    assert_eq!(alerts, 1);
    assert!(app.orders().await.is_empty());
}
