//! End-to-end tests driving the engine through the reqwest transport
//! against a real HTTP server.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use pushstream_client::testing::TestServer;
use pushstream_client::{HttpTransport, StreamingSession, SubscriptionOptions, SubscriptionState};
use pushstream_core::{MessageData, ParserFacade, SubscriptionArgs, UpdateType, FORMAT_JSON};

#[derive(Clone, Default)]
struct BackendState {
    deletes: Arc<Mutex<Vec<(String, String)>>>,
}

async fn create_subscription(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "State": "active",
        "Format": body["Format"],
        "ContextId": body["ContextId"],
        "InactivityTimeout": 60,
        "RefreshRate": body["RefreshRate"],
        "Snapshot": {"Quote": {"Bid": 1.1, "Ask": 1.2}},
    }))
}

async fn remove_subscription(
    State(state): State<BackendState>,
    Path((context_id, reference_id)): Path<(String, String)>,
) -> StatusCode {
    state.deletes.lock().push((context_id, reference_id));
    StatusCode::OK
}

async fn reject_subscription() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ErrorCode": "InvalidRequest", "Message": "bad arguments"})),
    )
}

fn price_router(state: BackendState) -> Router {
    Router::new()
        .route("/trade/v1/prices/subscriptions", post(create_subscription))
        .route(
            "/trade/v1/prices/subscriptions/{context_id}/{reference_id}",
            delete(remove_subscription),
        )
        .with_state(state)
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let backend = BackendState::default();
    let server = TestServer::start(price_router(backend.clone())).await.unwrap();

    let transport = Arc::new(HttpTransport::new(&server.base_url()).unwrap());
    let parsers = Arc::new(ParserFacade::new());
    let mut session = StreamingSession::with_context_id(transport, parsers, "itest-ctx");
    session.on_connection_available();

    let updates: Arc<Mutex<Vec<(Value, UpdateType)>>> = Arc::new(Mutex::new(Vec::new()));
    let options = SubscriptionOptions {
        on_update: Some(Box::new({
            let updates = Arc::clone(&updates);
            move |message, update_type| {
                if let MessageData::Json(value) = &message.data {
                    updates.lock().push((value.clone(), update_type));
                }
            }
        })),
        ..Default::default()
    };

    let key = session.create_subscription(
        "trade",
        "v1/prices/subscriptions",
        SubscriptionArgs::new(FORMAT_JSON).with_arguments(json!({"Uic": 21})),
        options,
    );

    assert!(session.process_next_event().await);
    assert_eq!(
        session.subscription(key).unwrap().state(),
        SubscriptionState::Subscribed
    );
    assert_eq!(
        updates.lock().clone(),
        vec![(
            json!({"Quote": {"Bid": 1.1, "Ask": 1.2}}),
            UpdateType::Snapshot
        )]
    );

    let reference_id = session
        .subscription(key)
        .unwrap()
        .reference_id()
        .unwrap()
        .to_string();

    session.subscription_mut(key).unwrap().on_unsubscribe(false);
    assert!(session.process_next_event().await);
    assert_eq!(
        session.subscription(key).unwrap().state(),
        SubscriptionState::Unsubscribed
    );

    assert_eq!(
        backend.deletes.lock().clone(),
        vec![("itest-ctx".to_string(), reference_id)]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn server_rejection_surfaces_through_the_error_callback() {
    let router = Router::new().route("/trade/v1/prices/subscriptions", post(reject_subscription));
    let server = TestServer::start(router).await.unwrap();

    let transport = Arc::new(HttpTransport::new(&server.base_url()).unwrap());
    let parsers = Arc::new(ParserFacade::new());
    let mut session = StreamingSession::with_context_id(transport, parsers, "itest-ctx");
    session.on_connection_available();

    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let options = SubscriptionOptions {
        on_error: Some(Box::new({
            let errors = Arc::clone(&errors);
            move |failure| errors.lock().push(failure.to_string())
        })),
        ..Default::default()
    };

    let key = session.create_subscription(
        "trade",
        "v1/prices/subscriptions",
        SubscriptionArgs::new(FORMAT_JSON),
        options,
    );

    assert!(session.process_next_event().await);
    assert_eq!(
        session.subscription(key).unwrap().state(),
        SubscriptionState::Unsubscribed
    );

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("InvalidRequest"));
    assert!(errors[0].contains("400"));

    server.shutdown().await;
}
