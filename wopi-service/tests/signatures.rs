mod common;

use common::{TestApp, TestOptions};
use reqwest::Method;
use serde_json::{json, Value};

async fn signed_app() -> TestApp {
    TestApp::spawn_with(TestOptions {
        require_signatures: true,
        ..Default::default()
    })
    .await
}

async fn create_signed_document(app: &TestApp, file_id: &str) {
    let response = app
        .signed(
            Method::POST,
            "/wopi/documents",
            &[("file_id", file_id), ("file_name", "doc.docx"), ("owner_id", "o")],
            b"signed body".to_vec(),
            &format!("create-{}", file_id),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
}

fn token_request(file_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "file_id": file_id,
        "user_id": "user-1",
        "user_name": "Ada Lovelace",
        "permission": "write",
    }))
    .unwrap()
}

#[tokio::test]
async fn unsigned_control_requests_are_rejected() {
    let app = signed_app().await;

    let response = app
        .client
        .post(app.url("/wopi/tokens"))
        .json(&json!({
            "file_id": "doc",
            "user_id": "user-1",
            "user_name": "Ada Lovelace",
            "permission": "write",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn signed_requests_are_accepted_once() {
    let app = signed_app().await;
    create_signed_document(&app, "doc").await;

    let response = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["access_token"].is_string());

    let replay = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-1")
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status().as_u16(), 401);
}

#[tokio::test]
async fn tampered_bodies_fail_verification() {
    let app = signed_app().await;
    create_signed_document(&app, "doc").await;

    let response = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-2")
        .body(token_request("other"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn tampered_query_strings_fail_verification() {
    let app = signed_app().await;

    let response = app
        .signed(
            Method::POST,
            "/wopi/documents",
            &[("file_id", "doc"), ("file_name", "doc.docx"), ("owner_id", "o")],
            b"contents".to_vec(),
            "nonce-4",
        )
        .query(&[("owner_id", "mallory")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // Nothing was registered under the signed id either.
    let response = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-5")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn revocation_is_a_signed_control_request() {
    let app = signed_app().await;
    create_signed_document(&app, "doc").await;

    let response = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-6")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let token = body["access_token"].as_str().unwrap().to_string();

    assert_eq!(app.revoke_token(&token).await.status().as_u16(), 401);
    assert_eq!(app.check_file_info("doc", &token).await.status().as_u16(), 200);

    let revoke = serde_json::to_vec(&json!({ "access_token": token })).unwrap();
    let response = app
        .signed(Method::POST, "/wopi/tokens/revoke", &[], revoke, "nonce-7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(app.check_file_info("doc", &token).await.status().as_u16(), 401);
}

#[tokio::test]
async fn editor_callbacks_need_only_the_access_token() {
    let app = signed_app().await;
    create_signed_document(&app, "doc").await;

    let response = app
        .signed(Method::POST, "/wopi/tokens", &[], token_request("doc"), "nonce-3")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let token = body["access_token"].as_str().unwrap();

    assert_eq!(app.check_file_info("doc", token).await.status().as_u16(), 200);
    let response = app.get_file("doc", token).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"signed body");
    assert_eq!(app.put_file("doc", token, b"edited").await.status().as_u16(), 200);
}

#[tokio::test]
async fn health_endpoints_are_not_signed() {
    let app = signed_app().await;
    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert!(response.status().is_success());
}
