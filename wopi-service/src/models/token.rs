use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access level granted by a token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn can_write(self) -> bool {
        match self {
            Permission::Read => false,
            Permission::Write => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            _ => Err(format!("Invalid permission: {}", s)),
        }
    }
}

/// A short-lived credential binding one user to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token_value: String,
    pub file_id: String,
    pub user_id: String,
    pub user_display_name: String,
    pub permission: Permission,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Valid up to and including `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Remaining lifetime in milliseconds, zero once expired.
    pub fn ttl_ms_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_milliseconds().max(0)
    }
}

/// What the token store persists. The token value itself is never stored,
/// only its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_digest: String,
    pub file_id: String,
    pub user_id: String,
    pub user_display_name: String,
    pub permission: Permission,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn into_token(self, token_value: &str) -> AccessToken {
        AccessToken {
            token_value: token_value.to_string(),
            file_id: self.file_id,
            user_id: self.user_id,
            user_display_name: self.user_display_name,
            permission: self.permission,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_write_can_write() {
        assert!(Permission::Write.can_write());
        assert!(!Permission::Read.can_write());
    }

    #[test]
    fn permission_parsing_is_strict() {
        assert_eq!("WRITE".parse::<Permission>().unwrap(), Permission::Write);
        assert!("admin".parse::<Permission>().is_err());
        assert!("writer".parse::<Permission>().is_err());
    }

    #[test]
    fn permission_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Permission::Read).unwrap(), "\"read\"");
    }

    #[test]
    fn token_is_valid_at_expiry_instant() {
        let issued_at = Utc::now();
        let token = AccessToken {
            token_value: "t".into(),
            file_id: "f1".into(),
            user_id: "u1".into(),
            user_display_name: "User".into(),
            permission: Permission::Read,
            issued_at,
            expires_at: issued_at + Duration::seconds(60),
        };
        assert!(!token.is_expired_at(token.expires_at));
        assert!(token.is_expired_at(token.expires_at + Duration::milliseconds(1)));
        assert_eq!(token.ttl_ms_at(issued_at), 60_000);
        assert_eq!(token.ttl_ms_at(token.expires_at + Duration::seconds(5)), 0);
    }
}
