use super::{Claims, Credential, CredentialError};
use chrono::Utc;
use parking_lot::RwLock;
use std::{fs, path::PathBuf};
use tracing::{debug, info, warn};

/// Where a static token comes from
#[derive(Debug, Clone)]
pub enum TokenSource {
    Inline(String),
    /// re-read whenever the held token is about to expire
    File(PathBuf),
}

impl TokenSource {
    /// exactly one of `token` and `token_file` has to be set
    pub fn from_parts(
        token: Option<String>,
        token_file: Option<PathBuf>,
    ) -> Result<Self, CredentialError> {
        match (token, token_file) {
            (Some(_), Some(_)) => Err(CredentialError::AmbiguousSource),
            (Some(token), None) => Ok(Self::Inline(token)),
            (None, Some(path)) => Ok(Self::File(path)),
            (None, None) => Err(CredentialError::MissingSource),
        }
    }

    /// current token text, without judging its expiry
    pub fn read(&self) -> Result<String, CredentialError> {
        match self {
            Self::Inline(token) => Ok(token.trim().to_owned()),
            Self::File(path) => fs::read_to_string(path)
                .map(|token| token.trim().to_owned())
                .map_err(|source| CredentialError::Read {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TokenState {
    pub token: String,
    pub claims: Claims,
}

impl TokenState {
    pub fn parse(token: String) -> Result<Self, CredentialError> {
        let claims = Claims::decode(&token)?;

        Ok(Self { token, claims })
    }
}

/// Token given inline or kept in a file that some other process rotates
#[derive(Debug)]
pub struct StaticCredential {
    source: TokenSource,
    state: RwLock<TokenState>,
}

impl StaticCredential {
    pub fn new(source: TokenSource) -> Result<Self, CredentialError> {
        let state = TokenState::parse(source.read()?)?;

        if state.claims.is_expired_at(Utc::now()) {
            return Err(state.claims.expired_error());
        }

        info!(
            subject = state.claims.subject(),
            expires_at = %state.claims.expires_at(),
            "Loaded token"
        );

        Ok(Self {
            source,
            state: RwLock::new(state),
        })
    }

    fn reload(&self) -> Result<(), CredentialError> {
        let TokenSource::File(path) = &self.source else {
            return Ok(());
        };

        let state = TokenState::parse(self.source.read()?)?;
        debug!(path = ?path, expires_at = %state.claims.expires_at(), "Reloaded token file");

        *self.state.write() = state;

        Ok(())
    }
}

impl Credential for StaticCredential {
    fn get_token(&self) -> Result<String, CredentialError> {
        if self.is_expired() {
            self.reload()?;
        }

        let state = self.state.read();
        let now = Utc::now();

        if state.claims.is_expired_at(now) {
            Err(state.claims.expired_error())
        } else {
            if state.claims.needs_refresh_at(now) {
                warn!(
                    subject = state.claims.subject(),
                    expires_at = %state.claims.expires_at(),
                    "Token is about to expire and no newer one is available"
                );
            }

            Ok(state.token.clone())
        }
    }

    fn is_expired(&self) -> bool {
        self.state.read().claims.needs_refresh_at(Utc::now())
    }

    fn claims(&self) -> Claims {
        self.state.read().claims.clone()
    }
}
