use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header names carrying a request signature.
pub const CLIENT_ID_HEADER: &str = "X-Client-ID";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Query parameters that carry the signature itself and are never signed.
const SIGNATURE_QUERY_PARAMS: [&str; 4] = ["client_id", "timestamp", "nonce", "signature"];

/// The request target a signature covers: the path plus its query string,
/// minus any signature parameters. Both sides must build it this way.
pub fn signing_target(path: &str, query: Option<&str>) -> String {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return path.to_string();
    };

    let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(query) {
        Ok(pairs) => pairs,
        Err(_) => return format!("{}?{}", path, query),
    };
    let signed: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(key, _)| !SIGNATURE_QUERY_PARAMS.contains(&key.as_str()))
        .collect();
    if signed.is_empty() {
        return path.to_string();
    }

    match serde_urlencoded::to_string(&signed) {
        Ok(encoded) => format!("{}?{}", path, encoded),
        Err(_) => format!("{}?{}", path, query),
    }
}

/// Generate HMAC-SHA256 signature
///
/// Format: HMAC-SHA256(method|target|timestamp|nonce|body_hash, secret), where
/// `target` is built by [`signing_target`].
pub fn generate_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    let body_hash = sha256_hex(body);
    let payload = format!("{}|{}|{}|{}|{}", method, path, timestamp, nonce, body_hash);

    mac.update(payload.as_bytes());
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Verify HMAC-SHA256 signature using constant-time comparison
pub fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, method, path, timestamp, nonce, body)?;
    Ok(constant_time_eq(
        expected_signature.as_bytes(),
        signature.as_bytes(),
    ))
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare two byte strings without short-circuiting on the first mismatch.
/// Length is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
