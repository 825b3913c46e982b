use super::{file::TokenState, Claims, Credential, CredentialError, StaticCredential};
use crate::config::ExchangeConfig;
use chrono::Utc;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

#[derive(Deserialize)]
struct ProviderMetadata {
    token_endpoint: String,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
}

/// Access token obtained through an OAuth2 token exchange (RFC 8693).
///
/// The subject token is exchanged again whenever the held access token gets
/// within the refresh margin of its expiry. The token endpoint is discovered
/// once from the issuer's metadata and cached afterwards.
#[derive(Debug)]
pub struct ExchangeCredential {
    subject: StaticCredential,
    config: ExchangeConfig,
    client: Client,
    token_endpoint: OnceCell<String>,
    state: RwLock<TokenState>,
    refreshing: Mutex<()>,
}

impl ExchangeCredential {
    pub fn new(
        subject: StaticCredential,
        config: ExchangeConfig,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder().timeout(timeout).build()?;
        let token_endpoint = OnceCell::new();
        let state = exchange(&client, &config, &token_endpoint, &subject)?;

        Ok(Self {
            subject,
            config,
            client,
            token_endpoint,
            state: RwLock::new(state),
            refreshing: Mutex::new(()),
        })
    }

    fn refresh(&self) -> Result<(), CredentialError> {
        let _guard = self.refreshing.lock();

        // someone else may have refreshed while we were waiting
        if !self.is_expired() {
            return Ok(());
        }

        let state = exchange(
            &self.client,
            &self.config,
            &self.token_endpoint,
            &self.subject,
        )?;
        *self.state.write() = state;

        Ok(())
    }
}

fn discover(client: &Client, issuer: &str) -> Result<String, CredentialError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let discovery_error = |reason: String| CredentialError::Discovery {
        url: url.clone(),
        reason,
    };

    let response = client
        .get(&url)
        .send()
        .map_err(|error| discovery_error(error.to_string()))?;

    if !response.status().is_success() {
        return Err(discovery_error(format!("HTTP {}", response.status())));
    }

    let metadata: ProviderMetadata = response
        .json()
        .map_err(|error| discovery_error(error.to_string()))?;
    info!(token_endpoint = %metadata.token_endpoint, "Discovered token endpoint");

    Ok(metadata.token_endpoint)
}

#[instrument(skip_all, fields(issuer = %config.issuer))]
fn exchange(
    client: &Client,
    config: &ExchangeConfig,
    token_endpoint: &OnceCell<String>,
    subject: &StaticCredential,
) -> Result<TokenState, CredentialError> {
    let endpoint = token_endpoint.get_or_try_init(|| discover(client, &config.issuer))?;
    let subject_token = subject.get_token()?;

    let mut form = vec![
        ("grant_type", GRANT_TYPE.to_owned()),
        ("subject_token", subject_token),
        ("subject_token_type", ACCESS_TOKEN_TYPE.to_owned()),
        ("requested_token_type", ACCESS_TOKEN_TYPE.to_owned()),
        ("client_id", config.client_id.clone()),
    ];
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    if let Some(audience) = &config.audience {
        form.push(("audience", audience.clone()));
    }
    if let Some(scope) = &config.scope {
        form.push(("scope", scope.clone()));
    }

    let response = client.post(endpoint.as_str()).form(&form).send()?;
    let status = response.status();

    if !status.is_success() {
        return Err(CredentialError::Exchange {
            status,
            body: response.text().unwrap_or_default(),
        });
    }

    let state = TokenState::parse(response.json::<ExchangeResponse>()?.access_token)?;

    if state.claims.is_expired_at(Utc::now()) {
        return Err(state.claims.expired_error());
    }

    debug!(expires_at = %state.claims.expires_at(), "Exchanged token");

    Ok(state)
}

impl Credential for ExchangeCredential {
    fn get_token(&self) -> Result<String, CredentialError> {
        if self.is_expired() {
            self.refresh()?;
        }

        Ok(self.state.read().token.clone())
    }

    fn is_expired(&self) -> bool {
        self.state.read().claims.needs_refresh_at(Utc::now())
    }

    fn claims(&self) -> Claims {
        self.state.read().claims.clone()
    }
}
