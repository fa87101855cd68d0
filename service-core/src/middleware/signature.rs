use crate::error::AppError;
use crate::utils::signature::{
    CLIENT_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, signing_target,
    verify_signature,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct SignatureConfig {
    pub require_signatures: bool,
    /// Accepted distance between the signed timestamp and now.
    pub max_clock_skew_seconds: i64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            max_clock_skew_seconds: 60,
        }
    }
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Record `nonce`; returns false when it was already used.
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

#[derive(Deserialize)]
struct SignatureQuery {
    client_id: Option<String>,
    timestamp: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref().clone();

    if !config.require_signatures {
        let has_header = req.headers().contains_key(SIGNATURE_HEADER);
        let has_query = req
            .uri()
            .query()
            .map(|q| q.contains("signature="))
            .unwrap_or(false);
        if !has_header && !has_query {
            return Ok(next.run(req).await);
        }
    }

    let (client_id, timestamp_str, nonce, signature) = extract_auth_data(&req)?;

    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid timestamp format")))?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > config.max_clock_skew_seconds {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Request timestamp expired"
        )));
    }

    let secret = state.get_signing_secret(&client_id).await?;
    let secret = secret.ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Invalid Client ID")))?;

    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    let method = parts.method.as_str();
    let path = parts.uri.path();
    let target = signing_target(path, parts.uri.query());

    let is_valid = verify_signature(
        &secret, method, &target, timestamp, &nonce, &bytes, &signature,
    )
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        tracing::warn!(client_id = %client_id, path = %path, "Rejected request with invalid signature");
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid signature")));
    }

    // Burn the nonce only once the signature is known to be genuine.
    if !state.validate_nonce(&nonce).await? {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Replay detected (nonce used)"
        )));
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn extract_auth_data(req: &Request) -> Result<(String, String, String, String), AppError> {
    let headers = req.headers();

    if headers.contains_key(SIGNATURE_HEADER) {
        let client_id = get_header(headers, CLIENT_ID_HEADER)?;
        let timestamp = get_header(headers, TIMESTAMP_HEADER)?;
        let nonce = get_header(headers, NONCE_HEADER)?;
        let signature = get_header(headers, SIGNATURE_HEADER)?;
        return Ok((client_id, timestamp, nonce, signature));
    }

    if let Some(query) = req.uri().query() {
        let params: SignatureQuery = serde_urlencoded::from_str(query)
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid query parameters")))?;

        if let (Some(cid), Some(ts), Some(n), Some(sig)) = (
            params.client_id,
            params.timestamp,
            params.nonce,
            params.signature,
        ) {
            return Ok((cid, ts, n, sig));
        }
    }

    Err(AppError::AuthError(anyhow::anyhow!(
        "Missing signature data (headers or query params)"
    )))
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}
