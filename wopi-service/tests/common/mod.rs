#![allow(dead_code)]

use chrono::Utc;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::{Config as CoreConfig, Environment};
use service_core::utils::signature::{
    generate_signature, signing_target, CLIENT_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use wopi_service::config::{
    DiscoveryConfig, SecurityConfig, StorageConfig, StorageRetryConfig, TokenConfig,
    TokenStoreBackend, TokenStoreConfig, WopiConfig,
};
use wopi_service::services::MemoryStore;
use wopi_service::Application;

pub const SIGNING_CLIENT_ID: &str = "backend";
pub const SIGNING_SECRET: &str = "test-signing-secret";
pub const PUBLIC_EDITOR_URL: &str = "https://office.example.com";
pub const WOPI_BASE_URL: &str = "http://wopi.internal:8080";

/// Collabora-style discovery: calc publishes edit and view, writer only a
/// relative edit action.
pub const DISCOVERY_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<wopi-discovery>
  <net-zone name="external-http">
    <app name="calc">
      <action default="true" ext="xlsx" name="edit" urlsrc="https://office.example.com/browser/0b27e85/cool.html?&lt;ui=UI_LLCC&amp;&gt;"/>
      <action ext="xlsx" name="view" urlsrc="https://office.example.com/browser/0b27e85/cool.html?permission=view&amp;"/>
    </app>
    <app name="writer">
      <action default="true" ext="docx" name="edit" urlsrc="/browser/0b27e85/cool.html?&lt;ui=UI_LLCC&amp;&gt;"/>
    </app>
  </net-zone>
</wopi-discovery>"#;

#[derive(Clone)]
pub struct TestOptions {
    pub require_signatures: bool,
    pub max_file_size: u64,
    pub token_ttl_seconds: u64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            require_signatures: false,
            max_file_size: 1024 * 1024,
            token_ttl_seconds: 3600,
        }
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub editor: MockServer,
    pub kv: Arc<MemoryStore>,
    pub storage_dir: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let editor = MockServer::start().await;
        let storage_dir = tempfile::tempdir().expect("Failed to create storage dir");

        let config = WopiConfig {
            common: CoreConfig { port: 0 },
            environment: Environment::Dev,
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            token_store: TokenStoreConfig {
                backend: TokenStoreBackend::Memory,
                redis_url: "redis://127.0.0.1:6379".to_string(),
            },
            token: TokenConfig {
                ttl_seconds: options.token_ttl_seconds,
                expiry_grace_seconds: 300,
            },
            storage: StorageConfig {
                root: storage_dir.path().to_string_lossy().to_string(),
                max_file_size: options.max_file_size,
                chunk_size: 1024,
            },
            retry: StorageRetryConfig {
                max_retries: 1,
                initial_backoff_ms: 10,
            },
            discovery: DiscoveryConfig {
                editor_url: editor.uri(),
                public_editor_url: PUBLIC_EDITOR_URL.to_string(),
                wopi_base_url: WOPI_BASE_URL.to_string(),
                cache_ttl_seconds: 300,
                request_timeout_seconds: 2,
            },
            security: SecurityConfig {
                require_signatures: options.require_signatures,
                signing_client_id: SIGNING_CLIENT_ID.to_string(),
                signing_secret: Secret::new(SIGNING_SECRET.to_string()),
            },
        };

        let kv = Arc::new(MemoryStore::new());
        let app = Application::build_with_store(config, kv.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped(std::future::pending()).await.ok();
        });

        // Wait for the server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            editor,
            kv,
            storage_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Serve `DISCOVERY_XML` from the mock editor host.
    pub async fn mount_discovery(&self) {
        Mock::given(method("GET"))
            .and(path("/hosting/discovery"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DISCOVERY_XML))
            .mount(&self.editor)
            .await;
    }

    pub async fn create_document(&self, file_id: &str, file_name: &str, body: &[u8]) -> Value {
        let response = self
            .client
            .post(self.url("/wopi/documents"))
            .query(&[
                ("file_id", file_id),
                ("file_name", file_name),
                ("owner_id", "owner-1"),
            ])
            .body(body.to_vec())
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 201, "document creation failed");
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn issue_token_response(&self, file_id: &str, permission: &str) -> reqwest::Response {
        self.client
            .post(self.url("/wopi/tokens"))
            .json(&json!({
                "file_id": file_id,
                "user_id": "user-1",
                "user_name": "Ada Lovelace",
                "permission": permission,
            }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn issue_token(&self, file_id: &str, permission: &str) -> String {
        let response = self.issue_token_response(file_id, permission).await;
        assert_eq!(response.status().as_u16(), 200, "token issue failed");
        let body: Value = response.json().await.expect("Failed to parse JSON");
        body["access_token"]
            .as_str()
            .expect("access_token missing")
            .to_string()
    }

    pub async fn revoke_token(&self, token: &str) -> reqwest::Response {
        self.client
            .post(self.url("/wopi/tokens/revoke"))
            .json(&json!({ "access_token": token }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn check_file_info(&self, file_id: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/wopi/files/{}", file_id)))
            .query(&[("access_token", token)])
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_file(&self, file_id: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.url(&format!("/wopi/files/{}/contents", file_id)))
            .query(&[("access_token", token)])
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn put_file(&self, file_id: &str, token: &str, body: &[u8]) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/wopi/files/{}/contents", file_id)))
            .query(&[("access_token", token)])
            .header("X-WOPI-Override", "PUT")
            .body(body.to_vec())
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn contents(&self, file_id: &str) -> Vec<u8> {
        let token = self.issue_token(file_id, "read").await;
        let response = self.get_file(file_id, &token).await;
        assert_eq!(response.status().as_u16(), 200);
        response.bytes().await.expect("Failed to read body").to_vec()
    }

    /// Build a request signed the way the trusted backend signs it. The query
    /// string is part of the signed target.
    pub fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Vec<u8>,
        nonce: &str,
    ) -> reqwest::RequestBuilder {
        let mut url = Url::parse(&self.url(path)).expect("Invalid test URL");
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let timestamp = Utc::now().timestamp();
        let signature = generate_signature(
            SIGNING_SECRET,
            method.as_str(),
            &signing_target(url.path(), url.query()),
            timestamp,
            nonce,
            &body,
        )
        .expect("Failed to sign request");

        self.client
            .request(method, url)
            .header(CLIENT_ID_HEADER, SIGNING_CLIENT_ID)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(NONCE_HEADER, nonce)
            .header(SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(body)
    }
}

pub async fn error_code(response: reqwest::Response) -> String {
    let body: Value = response.json().await.expect("Failed to parse error body");
    body["error"]["code"]
        .as_str()
        .expect("error code missing")
        .to_string()
}
