//! Issues, validates and revokes WOPI access tokens.
//!
//! Tokens live only in the shared [`ExpiringStore`]. Records are keyed by the
//! SHA-256 of the token value, so the plaintext token is never persisted and
//! the store lookup never compares secret bytes directly.

use crate::config::{MAX_EXPIRY_GRACE_SECONDS, MAX_TOKEN_TTL_SECONDS};
use crate::error::WopiError;
use crate::models::{AccessToken, FileId, Permission, TokenRecord};
use crate::services::kv::ExpiringStore;
use crate::services::storage::Storage;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use service_core::utils::signature::{constant_time_eq, sha256_hex};
use std::sync::Arc;

const TOKEN_KEY_PREFIX: &str = "wopi:token:";
const TOKEN_BYTES: usize = 32;

/// Lifetime policy applied to every issued token.
#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    pub ttl: Duration,
    pub expiry_grace: Duration,
}

impl TokenPolicy {
    /// Values beyond the configured maximums are clamped.
    pub fn from_seconds(ttl_seconds: u64, expiry_grace_seconds: u64) -> Self {
        let ttl = ttl_seconds.clamp(1, MAX_TOKEN_TTL_SECONDS);
        let grace = expiry_grace_seconds.min(MAX_EXPIRY_GRACE_SECONDS);
        Self {
            ttl: Duration::seconds(ttl as i64),
            expiry_grace: Duration::seconds(grace as i64),
        }
    }
}

#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn ExpiringStore>,
    storage: Arc<dyn Storage>,
    policy: TokenPolicy,
}

impl TokenStore {
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        storage: Arc<dyn Storage>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            store,
            storage,
            policy,
        }
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    pub async fn issue(
        &self,
        file_id: &str,
        user_id: &str,
        user_display_name: &str,
        permission: Permission,
    ) -> Result<AccessToken, WopiError> {
        self.issue_at(file_id, user_id, user_display_name, permission, Utc::now())
            .await
    }

    /// Mint a token as of `now`. The TTL always comes from the policy.
    pub async fn issue_at(
        &self,
        file_id: &str,
        user_id: &str,
        user_display_name: &str,
        permission: Permission,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, WopiError> {
        let id = FileId::parse(file_id)
            .ok_or_else(|| WopiError::UnknownFile(file_id.to_string()))?;
        let handle = self.storage.load_handle(&id).await?;
        if handle.is_none() {
            return Err(WopiError::UnknownFile(file_id.to_string()));
        }

        let token_value = generate_token_value();
        let digest = sha256_hex(token_value.as_bytes());
        let expires_at = now + self.policy.ttl;

        let record = TokenRecord {
            token_digest: digest.clone(),
            file_id: id.to_string(),
            user_id: user_id.to_string(),
            user_display_name: user_display_name.to_string(),
            permission,
            issued_at: now,
            expires_at,
        };

        let payload = serde_json::to_string(&record)
            .map_err(|e| WopiError::Internal(anyhow::anyhow!("Failed to encode token: {}", e)))?;
        let record_ttl = (self.policy.ttl + self.policy.expiry_grace).num_seconds().max(1) as u64;

        self.store
            .set_ex(&record_key(&digest), &payload, record_ttl)
            .await
            .map_err(WopiError::TokenStoreUnavailable)?;

        tracing::info!(
            file_id = %id,
            user_id = %user_id,
            permission = %permission,
            token_prefix = %&digest[..8],
            expires_at = %expires_at,
            "Access token issued"
        );
        metrics::counter!("wopi_tokens_issued_total", "permission" => permission.as_str())
            .increment(1);

        Ok(record.into_token(&token_value))
    }

    pub async fn validate(&self, token_value: &str) -> Result<AccessToken, WopiError> {
        self.validate_at(token_value, Utc::now()).await
    }

    /// Fails with `Expired` when the record is still present but `now` is past
    /// `expires_at`, and with `TokenNotFound` when there is no record.
    pub async fn validate_at(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, WopiError> {
        let digest = sha256_hex(token_value.as_bytes());
        let key = record_key(&digest);

        let payload = self
            .store
            .get(&key)
            .await
            .map_err(WopiError::TokenStoreUnavailable)?
            .ok_or(WopiError::TokenNotFound)?;

        let record: TokenRecord = serde_json::from_str(&payload).map_err(|e| {
            tracing::error!(error = %e, "Corrupt token record");
            WopiError::TokenNotFound
        })?;

        if !constant_time_eq(record.token_digest.as_bytes(), digest.as_bytes()) {
            return Err(WopiError::TokenNotFound);
        }

        let token = record.into_token(token_value);
        if token.is_expired_at(now) {
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(error = %e, "Failed to purge expired token");
            }
            return Err(WopiError::Expired);
        }

        Ok(token)
    }

    /// Invalidate a token immediately. Revoking an unknown token succeeds.
    pub async fn revoke(&self, token_value: &str) -> Result<(), WopiError> {
        let digest = sha256_hex(token_value.as_bytes());
        self.store
            .delete(&record_key(&digest))
            .await
            .map_err(WopiError::TokenStoreUnavailable)?;
        tracing::info!(token_prefix = %&digest[..8], "Access token revoked");
        Ok(())
    }
}

fn record_key(digest: &str) -> String {
    format!("{}{}", TOKEN_KEY_PREFIX, digest)
}

/// 32 bytes from the OS CSPRNG, base64url without padding.
fn generate_token_value() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryStore;
    use crate::services::storage::LocalStorage;
    use tempfile::TempDir;

    async fn setup(ttl_seconds: u64) -> (TokenStore, Arc<MemoryStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path(), 1024 * 1024, 4096).await.unwrap());
        storage
            .create(&FileId::parse("f1").unwrap(), "sheet.xlsx", "owner", b"hello")
            .await
            .unwrap();
        let kv = Arc::new(MemoryStore::new());
        let store = TokenStore::new(
            kv.clone(),
            storage,
            TokenPolicy::from_seconds(ttl_seconds, 300),
        );
        (store, kv, dir)
    }

    #[tokio::test]
    async fn issued_token_is_opaque_and_unguessable() {
        let (store, _kv, _dir) = setup(3600).await;
        let a = store.issue("f1", "u1", "User", Permission::Read).await.unwrap();
        let b = store.issue("f1", "u1", "User", Permission::Read).await.unwrap();
        assert_eq!(a.token_value.len(), 43);
        assert_ne!(a.token_value, b.token_value);
    }

    #[tokio::test]
    async fn plaintext_token_is_never_stored() {
        let (store, kv, _dir) = setup(3600).await;
        let token = store.issue("f1", "u1", "User", Permission::Write).await.unwrap();
        let key = record_key(&sha256_hex(token.token_value.as_bytes()));
        let stored = kv.get(&key).await.unwrap().unwrap();
        assert!(!stored.contains(&token.token_value));
    }

    #[tokio::test]
    async fn issue_rejects_unknown_files() {
        let (store, _kv, _dir) = setup(3600).await;
        let err = store
            .issue("nope", "u1", "User", Permission::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, WopiError::UnknownFile(_)));

        let err = store
            .issue("../f1", "u1", "User", Permission::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, WopiError::UnknownFile(_)));
    }

    #[tokio::test]
    async fn validate_succeeds_until_expiry_and_fails_strictly_after() {
        let (store, _kv, _dir) = setup(3600).await;
        let issued_at = Utc::now();
        let token = store
            .issue_at("f1", "u1", "User", Permission::Write, issued_at)
            .await
            .unwrap();
        assert_eq!(token.expires_at, issued_at + Duration::seconds(3600));

        let at_issue = store.validate_at(&token.token_value, issued_at).await.unwrap();
        assert_eq!(at_issue, token);

        let at_expiry = store.validate_at(&token.token_value, token.expires_at).await;
        assert!(at_expiry.is_ok());

        let after = store
            .validate_at(&token.token_value, token.expires_at + Duration::milliseconds(1))
            .await
            .unwrap_err();
        assert!(matches!(after, WopiError::Expired));

        // The expired record is purged once observed.
        let again = store
            .validate_at(&token.token_value, token.expires_at + Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(again, WopiError::TokenNotFound));
    }

    #[test]
    fn oversized_lifetimes_are_clamped() {
        let policy = TokenPolicy::from_seconds(u64::MAX, u64::MAX);
        assert_eq!(policy.ttl, Duration::seconds(MAX_TOKEN_TTL_SECONDS as i64));
        assert_eq!(
            policy.expiry_grace,
            Duration::seconds(MAX_EXPIRY_GRACE_SECONDS as i64)
        );
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (store, _kv, _dir) = setup(3600).await;
        let err = store.validate("not-a-token").await.unwrap_err();
        assert!(matches!(err, WopiError::TokenNotFound));
    }

    #[tokio::test]
    async fn revoke_is_immediate_and_idempotent() {
        let (store, _kv, _dir) = setup(3600).await;
        let token = store.issue("f1", "u1", "User", Permission::Read).await.unwrap();

        store.revoke(&token.token_value).await.unwrap();
        let err = store.validate(&token.token_value).await.unwrap_err();
        assert!(matches!(err, WopiError::TokenNotFound));

        store.revoke(&token.token_value).await.unwrap();
        store.revoke("never-issued").await.unwrap();
    }
}
