use super::{CredentialError, REFRESH_MARGIN_SECS};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The subset of JWT claims needed to judge a token's lifetime.
///
/// Signatures are not verified here, the token came from a trusted issuer
/// over TLS and is only inspected for its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn decode(token: &str) -> Result<Self, CredentialError> {
        let mut parts = token.trim().split('.');

        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_header), Some(payload), Some(_signature), None) if !payload.is_empty() => {
                payload
            }
            _ => {
                return Err(CredentialError::Malformed(
                    "expected three dot separated segments".to_owned(),
                ))
            }
        };

        // some issuers pad anyway
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn subject(&self) -> &str {
        self.sub.as_deref().unwrap_or("<unknown>")
    }

    /// hard expiry, no margin
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }

    /// expiry including the refresh margin
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        self.exp.saturating_sub(now.timestamp()) <= REFRESH_MARGIN_SECS
    }

    pub(crate) fn expired_error(&self) -> CredentialError {
        CredentialError::Expired {
            subject: self.subject().to_owned(),
            expired_at: self.expires_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::testing::token;

    #[test]
    fn decode_reads_payload() {
        let claims = Claims::decode(&token("alice", 3600)).unwrap();

        assert_eq!(claims.subject(), "alice");
        assert_eq!(claims.iss.as_deref(), Some("https://issuer.test"));
        assert!(!claims.is_expired_at(Utc::now()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Claims::decode("not-a-token"),
            Err(CredentialError::Malformed(_))
        ));
        assert!(matches!(
            Claims::decode("a.b.c.d"),
            Err(CredentialError::Malformed(_))
        ));
        assert!(matches!(
            Claims::decode("a.!!!.c"),
            Err(CredentialError::Decode(_))
        ));
    }

    #[test]
    fn margin_is_applied() {
        let now = Utc::now();
        let short = Claims::decode(&token("bob", 30)).unwrap();
        let long = Claims::decode(&token("bob", 3600)).unwrap();

        assert!(short.needs_refresh_at(now));
        assert!(!short.is_expired_at(now));
        assert!(!long.needs_refresh_at(now));
    }

    #[test]
    fn extreme_expiry_does_not_overflow() {
        let claims = |exp| Claims {
            exp,
            sub: None,
            iss: None,
            iat: None,
        };
        let now = Utc::now();

        assert!(claims(i64::MIN).needs_refresh_at(now));
        assert!(claims(i64::MIN).is_expired_at(now));
        assert!(!claims(i64::MAX).needs_refresh_at(now));
        assert_eq!(claims(i64::MIN).expires_at(), DateTime::<Utc>::MIN_UTC);
    }
}
