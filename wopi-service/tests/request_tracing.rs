mod common;

use common::TestApp;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

type SpanFields = HashMap<String, String>;

/// Records the fields of every `http_request` span.
struct RequestSpans;

#[derive(Default)]
struct FieldRecorder(SpanFields);

impl Visit for FieldRecorder {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

impl<S: Subscriber> Layer<S> for RequestSpans {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        if attrs.metadata().name() != "http_request" {
            return;
        }
        let mut recorder = FieldRecorder::default();
        attrs.record(&mut recorder);
        captured().lock().unwrap().push(recorder.0);
    }
}

fn captured() -> &'static Mutex<Vec<SpanFields>> {
    static SPANS: OnceLock<Mutex<Vec<SpanFields>>> = OnceLock::new();
    SPANS.get_or_init(|| Mutex::new(Vec::new()))
}

fn install_capture() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let subscriber = tracing_subscriber::registry().with(RequestSpans);
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to install span capture");
    });
}

fn span_with_request_id(request_id: &str) -> Option<SpanFields> {
    captured()
        .lock()
        .unwrap()
        .iter()
        .find(|fields| fields.get("request_id").map(String::as_str) == Some(request_id))
        .cloned()
}

#[tokio::test]
async fn request_span_carries_the_minted_request_id() {
    install_capture();
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");
    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Missing request id")
        .to_str()
        .unwrap()
        .to_string();
    assert!(uuid::Uuid::parse_str(&request_id).is_ok());

    let span = span_with_request_id(&request_id).expect("No span recorded the minted id");
    assert_eq!(span["path"], "/health");
    assert_eq!(span["method"], "GET");
}

#[tokio::test]
async fn revocation_never_writes_the_token_into_request_spans() {
    install_capture();
    let app = TestApp::spawn().await;
    app.create_document("doc", "doc.docx", b"x").await;
    let token = app.issue_token("doc", "write").await;

    let response = app
        .client
        .post(app.url("/wopi/tokens/revoke"))
        .header("x-request-id", "revoke-span-check")
        .json(&serde_json::json!({ "access_token": token }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 204);

    let span = span_with_request_id("revoke-span-check").expect("Revocation span missing");
    assert_eq!(span["path"], "/wopi/tokens/revoke");

    let leaked = captured()
        .lock()
        .unwrap()
        .iter()
        .any(|fields| fields.values().any(|value| value.contains(&token)));
    assert!(!leaked, "access token recorded in a request span");
}
