/*
[INPUT]:  Auth URL, configured grant, request policy, optional refresh token
[OUTPUT]: Fresh Credential values or a typed AuthError
[POS]:    Auth layer - token acquisition with redirect / retry / fallback handling
[UPDATE]: When the token endpoint contract or failure policy changes
*/

use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use super::credential::{Credential, TokenResponse};
use super::grant::{Form, Grant};
use super::password::PasswordPolicy;
use crate::http::policy::{RedirectStep, RequestPolicy, StatusClass};
use crate::http::{AuthError, AuthResult, ClientConfig};

/// Obtains and refreshes credentials from the token endpoint.
///
/// The provider holds no credential state; every call returns a new
/// [`Credential`] for the caller to own.
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    http: Client,
    auth_url: Url,
    grant: Grant,
    policy: RequestPolicy,
    password_policy: PasswordPolicy,
}

impl CredentialProvider {
    pub fn new(http: Client, auth_url: Url, grant: Grant, policy: RequestPolicy) -> Self {
        Self {
            http,
            auth_url,
            grant,
            policy,
            password_policy: PasswordPolicy::default(),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        auth_url: Url,
        grant: Grant,
        policy: RequestPolicy,
    ) -> AuthResult<Self> {
        Ok(Self::new(config.build_client()?, auth_url, grant, policy))
    }

    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    pub fn supports_refresh(&self) -> bool {
        self.grant.supports_refresh()
    }

    /// Request a credential.
    ///
    /// With a refresh token and a grant that supports it this is a refresh
    /// request; a 400/401 answer to it is retried once as a full grant.
    /// Without one it is a full grant request.
    pub async fn fetch(&self, refresh_token: Option<&str>) -> AuthResult<Credential> {
        match refresh_token.and_then(|token| self.grant.refresh_form(token)) {
            Some(form) => {
                debug!(grant = self.grant.kind(), "requesting credential with refresh token");
                self.request(form, true).await
            }
            None => {
                debug!(grant = self.grant.kind(), "requesting credential with full grant");
                self.request(self.grant.token_form()?, false).await
            }
        }
    }

    /// Full grant request
    pub async fn authenticate(&self) -> AuthResult<Credential> {
        self.fetch(None).await
    }

    /// Refresh `current`, or re-authenticate when it carries no refresh token.
    pub async fn refresh(&self, current: &Credential) -> AuthResult<Credential> {
        self.fetch(current.refresh_token.as_deref()).await
    }

    /// Change the account password and adopt it for later requests.
    pub async fn change_password(&mut self, new_password: &str) -> AuthResult<Credential> {
        self.password_policy.validate(new_password)?;
        let form = self.grant.password_change_form(new_password)?;

        info!("requesting password change");
        let credential = self.request(form, false).await?;
        self.grant.set_password(new_password);
        info!("password changed");
        Ok(credential)
    }

    async fn request(&self, form: Form, mut is_refresh: bool) -> AuthResult<Credential> {
        let mut form = form;
        let mut url = self.auth_url.clone();
        let mut hops = 0usize;

        loop {
            let request = self
                .http
                .post(url.clone())
                .header(ACCEPT, "application/json")
                .form(&form);

            debug!(url = %url, is_refresh, "sending token request");
            let sent = tokio::select! {
                _ = self.policy.shutdown().cancelled() => return Err(AuthError::Canceled),
                sent = request.send() => sent,
            };

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %url, error = %err, "token request failed, retrying");
                    if !self.policy.backoff().await {
                        return Err(AuthError::Canceled);
                    }
                    url = self.auth_url.clone();
                    hops = 0;
                    continue;
                }
            };

            let status = response.status();
            match StatusClass::of(status) {
                StatusClass::Success => {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(err) => {
                            warn!(url = %url, error = %err, "reading token response failed, retrying");
                            if !self.policy.backoff().await {
                                return Err(AuthError::Canceled);
                            }
                            url = self.auth_url.clone();
                            hops = 0;
                            continue;
                        }
                    };
                    let token: TokenResponse = serde_json::from_str(&body)
                        .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
                    let credential = Credential::from(token);
                    info!(
                        expires_in = ?credential.expires_in,
                        has_refresh_token = credential.refresh_token.is_some(),
                        is_refresh,
                        "credential issued"
                    );
                    return Ok(credential);
                }
                StatusClass::Redirect => {
                    match self.policy.follow_redirect(&url, &response, &mut hops) {
                        RedirectStep::Follow(next) => {
                            info!(status = status.as_u16(), location = %next, "token request redirected");
                            url = next;
                        }
                        RedirectStep::MissingLocation => return Err(AuthError::http(status)),
                        RedirectStep::LimitReached(limit) => {
                            return Err(AuthError::TooManyRedirects { limit });
                        }
                        RedirectStep::BadLocation(err) => return Err(err.into()),
                    }
                }
                StatusClass::Rejected if is_refresh => {
                    warn!(
                        status = status.as_u16(),
                        "refresh token rejected, retrying with full grant"
                    );
                    is_refresh = false;
                    form = self.grant.token_form()?;
                    url = self.auth_url.clone();
                    hops = 0;
                }
                StatusClass::Rejected => return Err(AuthError::http(status)),
                StatusClass::Unrecoverable => return Err(AuthError::unrecoverable(status)),
                StatusClass::Retry => {
                    warn!(
                        status = status.as_u16(),
                        reason = status.canonical_reason().unwrap_or(""),
                        "token request failed, retrying"
                    );
                    if !self.policy.backoff().await {
                        return Err(AuthError::Canceled);
                    }
                    url = self.auth_url.clone();
                    hops = 0;
                }
            }
        }
    }
}
