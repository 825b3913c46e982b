pub mod claims;
pub mod exchange;
pub mod file;

pub use claims::Claims;
pub use exchange::ExchangeCredential;
pub use file::{StaticCredential, TokenSource};

use crate::config::TokenConfig;
use chrono::{DateTime, Utc};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Tokens expiring within this many seconds are treated as expired and refreshed
pub const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Token for {subject} expired at {expired_at} and could not be refreshed")]
    Expired {
        subject: String,
        expired_at: DateTime<Utc>,
    },
    #[error("Both an inline token and a token file were configured")]
    AmbiguousSource,
    #[error("Neither an inline token nor a token file was configured")]
    MissingSource,
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Failed to decode token payload")]
    Decode(#[from] base64::DecodeError),
    #[error("Failed to parse token claims")]
    Claims(#[from] serde_json::Error),
    #[error("Failed to read token file {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Token endpoint discovery at {url} failed: {reason}")]
    Discovery { url: String, reason: String },
    #[error("Token exchange failed with HTTP {status}: {body}")]
    Exchange { status: http::StatusCode, body: String },
    #[error("Token request failed")]
    Http(#[from] reqwest::Error),
}

/// A bearer token together with its refresh policy
pub trait Credential {
    /// a currently valid token, refreshing first if it is about to expire
    fn get_token(&self) -> Result<String, CredentialError>;

    /// true if the token expires within `REFRESH_MARGIN_SECS`
    fn is_expired(&self) -> bool;

    /// refresh if needed, failing if no valid token can be produced
    fn ensure_fresh(&self) -> Result<(), CredentialError> {
        self.get_token().map(|_| ())
    }

    /// claims of the token currently held
    fn claims(&self) -> Claims;
}

/// All supported credential variants
#[derive(Debug)]
pub enum Credentials {
    Static(StaticCredential),
    Exchange(ExchangeCredential),
}

impl Credentials {
    /// build a credential from its configuration, failing if no valid token is available right now
    pub fn load(config: &TokenConfig, timeout: Duration) -> Result<Self, CredentialError> {
        let source = TokenSource::from_parts(config.token.clone(), config.token_file.clone())?;
        let subject = StaticCredential::new(source)?;

        match &config.exchange {
            Some(exchange) => Ok(Self::Exchange(ExchangeCredential::new(
                subject,
                exchange.clone(),
                timeout,
            )?)),
            None => Ok(Self::Static(subject)),
        }
    }
}

impl Credential for Credentials {
    fn get_token(&self) -> Result<String, CredentialError> {
        match self {
            Self::Static(credential) => credential.get_token(),
            Self::Exchange(credential) => credential.get_token(),
        }
    }

    fn is_expired(&self) -> bool {
        match self {
            Self::Static(credential) => credential.is_expired(),
            Self::Exchange(credential) => credential.is_expired(),
        }
    }

    fn claims(&self) -> Claims {
        match self {
            Self::Static(credential) => credential.claims(),
            Self::Exchange(credential) => credential.claims(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::Utc;

    /// unsigned JWT for `subject` expiring `expires_in` seconds from now
    pub fn token(subject: &str, expires_in: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let now = Utc::now().timestamp();
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({
                "sub": subject,
                "iss": "https://issuer.test",
                "iat": now,
                "exp": now + expires_in,
            })
            .to_string(),
        );

        format!("{header}.{payload}.")
    }
}
