mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use parley_gateway::bus::user_group;
use parley_types::events::ServerEvent;

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn requires_a_valid_bearer_token() {
    let app = parley_api::router(common::gateway());

    let (status, _) = call(&app, Method::GET, "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::GET, "/conversations", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn conversation_round_trip() {
    let app = parley_api::router(common::gateway());
    let alice = common::token(1, "alice");
    let bob = common::token(2, "bob");

    // First authenticated request puts bob in the directory
    let (status, inbox) = call(&app, Method::GET, "/conversations", Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inbox, json!([]));

    let (status, conversation) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&alice),
        Some(json!({"peer_id": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["peer"]["username"], "bob");
    let id = conversation["id"].as_i64().unwrap();

    // Starting again returns the same conversation
    let (_, again) = call(
        &app,
        Method::POST,
        "/conversations",
        Some(&bob),
        Some(json!({"peer_id": 1})),
    )
    .await;
    assert_eq!(again["id"], id);

    let uri = format!("/conversations/{id}/messages");
    let (status, sent) = call(&app, Method::POST, &uri, Some(&alice), Some(json!({"content": "hi"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["content"], "hi");

    let (_, inbox) = call(&app, Method::GET, "/conversations", Some(&bob), None).await;
    assert_eq!(inbox[0]["has_unread"], true);
    assert_eq!(inbox[0]["unread_count"], 1);
    assert_eq!(inbox[0]["last_message"]["content"], "hi");

    let (status, messages) = call(&app, Method::GET, &uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);
    assert_eq!(messages[0]["is_read"], false);

    let read_uri = format!("/conversations/{id}/read");
    let (status, read) = call(&app, Method::POST, &read_uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["newly_read"], Value::Array(vec![sent["id"].clone()]));

    let (_, read) = call(&app, Method::POST, &read_uri, Some(&bob), None).await;
    assert_eq!(read["newly_read"], json!([]));

    let (_, inbox) = call(&app, Method::GET, "/conversations", Some(&bob), None).await;
    assert_eq!(inbox[0]["has_unread"], false);

    let (_, messages) = call(&app, Method::GET, &uri, Some(&alice), None).await;
    assert_eq!(messages[0]["is_read"], true);
}

#[tokio::test]
async fn paginates_messages_backwards() {
    let app = parley_api::router(common::gateway());
    let alice = common::token(1, "alice");
    let bob = common::token(2, "bob");
    call(&app, Method::GET, "/conversations", Some(&bob), None).await;

    let (_, conversation) = call(&app, Method::POST, "/conversations", Some(&alice), Some(json!({"peer_id": 2}))).await;
    let uri = format!("/conversations/{}/messages", conversation["id"]);
    let mut ids = vec![];
    for i in 0..5 {
        let (_, sent) = call(&app, Method::POST, &uri, Some(&alice), Some(json!({"content": format!("m{i}")}))).await;
        ids.push(sent["id"].as_i64().unwrap());
    }

    let (_, newest) = call(&app, Method::GET, &format!("{uri}?limit=2"), Some(&bob), None).await;
    let page: Vec<i64> = newest.as_array().unwrap().iter().map(|m| m["id"].as_i64().unwrap()).collect();
    assert_eq!(page, ids[3..]);

    let (_, older) = call(&app, Method::GET, &format!("{uri}?limit=2&before={}", ids[3]), Some(&bob), None).await;
    let page: Vec<i64> = older.as_array().unwrap().iter().map(|m| m["id"].as_i64().unwrap()).collect();
    assert_eq!(page, ids[1..3]);
}

#[tokio::test]
async fn rest_send_fans_out_to_live_connections() {
    let gateway = common::gateway();
    let app = parley_api::router(gateway.clone());
    let alice = common::token(1, "alice");
    let bob = common::token(2, "bob");
    call(&app, Method::GET, "/conversations", Some(&bob), None).await;
    let (_, conversation) = call(&app, Method::POST, "/conversations", Some(&alice), Some(json!({"peer_id": 2}))).await;

    let (_membership, mut bob_rx) = gateway.chat().fanout().subscribe(user_group(2));
    let uri = format!("/conversations/{}/messages", conversation["id"]);
    call(&app, Method::POST, &uri, Some(&alice), Some(json!({"content": "over http"}))).await;

    match &*bob_rx.try_recv().unwrap() {
        ServerEvent::Message { message } => assert_eq!(message.content, "over http"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn maps_failures_to_status_codes() {
    let app = parley_api::router(common::gateway());
    let alice = common::token(1, "alice");
    let bob = common::token(2, "bob");
    let mallory = common::token(3, "mallory");
    call(&app, Method::GET, "/conversations", Some(&bob), None).await;

    let (_, conversation) = call(&app, Method::POST, "/conversations", Some(&alice), Some(json!({"peer_id": 2}))).await;
    let uri = format!("/conversations/{}/messages", conversation["id"]);

    let (status, body) = call(&app, Method::POST, &uri, Some(&alice), Some(json!({"content": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    let (status, body) = call(&app, Method::GET, &uri, Some(&mallory), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = call(&app, Method::POST, "/conversations", Some(&alice), Some(json!({"peer_id": 99}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::POST, "/conversations", Some(&alice), Some(json!({"peer_id": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn searches_users_by_keyword() {
    let app = parley_api::router(common::gateway());
    for (id, name) in [(2, "bob"), (3, "Bobby"), (4, "carol")] {
        call(&app, Method::GET, "/conversations", Some(&common::token(id, name)), None).await;
    }
    let alice = common::token(1, "alice");

    let (status, users) = call(&app, Method::GET, "/users/search?keyword=BOB", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = users.as_array().unwrap().iter().map(|u| u["username"].as_str().unwrap()).collect();
    assert_eq!(names, ["bob", "Bobby"]);

    let (status, _) = call(&app, Method::GET, "/users/search", Some(&alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
