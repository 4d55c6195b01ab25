/*
[INPUT]:  Configured OAuth grant (password, client credentials, JWT bearer)
[OUTPUT]: Form bodies for token, refresh and password-change requests
[POS]:    Auth layer - token request encoding
[UPDATE]: When adding a grant type or changing form fields
*/

use chrono::Utc;
use std::fmt;

use super::assertion::AssertionSigner;
use crate::http::AuthError;

/// Default OAuth scope for streaming pricing
pub const DEFAULT_SCOPE: &str = "trapi.streaming.pricing.read";

const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Form body of a token request
pub type Form = Vec<(&'static str, String)>;

/// The one active grant used to obtain access tokens
#[derive(Clone)]
pub enum Grant {
    Password {
        username: String,
        password: String,
        client_id: String,
        scope: String,
        take_exclusive_sign_on_control: bool,
    },
    ClientCredentials {
        client_id: String,
        client_secret: String,
        scope: String,
    },
    JwtBearer {
        client_id: String,
        signer: AssertionSigner,
        audience: String,
        scope: String,
    },
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::Password {
                username, client_id, ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Grant::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Grant::JwtBearer {
                client_id, signer, ..
            } => f
                .debug_struct("JwtBearer")
                .field("client_id", client_id)
                .field("kid", &signer.kid())
                .finish_non_exhaustive(),
        }
    }
}

impl Grant {
    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Grant::Password {
            username: username.into(),
            password: password.into(),
            client_id: client_id.into(),
            scope: DEFAULT_SCOPE.to_string(),
            take_exclusive_sign_on_control: true,
        }
    }

    pub fn client_credentials(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Grant::ClientCredentials {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub fn jwt_bearer(
        client_id: impl Into<String>,
        signer: AssertionSigner,
        audience: impl Into<String>,
    ) -> Self {
        Grant::JwtBearer {
            client_id: client_id.into(),
            signer,
            audience: audience.into(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    /// Replace the requested scope
    pub fn with_scope(mut self, new_scope: impl Into<String>) -> Self {
        match &mut self {
            Grant::Password { scope, .. }
            | Grant::ClientCredentials { scope, .. }
            | Grant::JwtBearer { scope, .. } => *scope = new_scope.into(),
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Grant::Password { .. } => "password",
            Grant::ClientCredentials { .. } => "client_credentials",
            Grant::JwtBearer { .. } => "jwt_bearer",
        }
    }

    /// Only the password grant can be continued with a refresh token.
    pub fn supports_refresh(&self) -> bool {
        matches!(self, Grant::Password { .. })
    }

    /// Body of a full (non-refresh) token request.
    pub fn token_form(&self) -> Result<Form, AuthError> {
        match self {
            Grant::Password {
                username,
                password,
                client_id,
                scope,
                take_exclusive_sign_on_control,
            } => Ok(vec![
                ("username", username.clone()),
                ("password", password.clone()),
                ("grant_type", "password".to_string()),
                ("client_id", client_id.clone()),
                (
                    "takeExclusiveSignOnControl",
                    if *take_exclusive_sign_on_control { "True" } else { "False" }.to_string(),
                ),
                ("scope", scope.clone()),
            ]),
            Grant::ClientCredentials {
                client_id,
                client_secret,
                scope,
            } => Ok(vec![
                ("grant_type", "client_credentials".to_string()),
                ("client_id", client_id.clone()),
                ("client_secret", client_secret.clone()),
                ("scope", scope.clone()),
            ]),
            Grant::JwtBearer {
                client_id,
                signer,
                audience,
                scope,
            } => {
                let assertion = signer.sign(client_id, audience, Utc::now())?;
                Ok(vec![
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", client_id.clone()),
                    ("client_assertion_type", JWT_BEARER_ASSERTION_TYPE.to_string()),
                    ("client_assertion", assertion),
                    ("scope", scope.clone()),
                ])
            }
        }
    }

    /// Body of a refresh-token request, when the grant supports one.
    pub fn refresh_form(&self, refresh_token: &str) -> Option<Form> {
        match self {
            Grant::Password {
                username,
                client_id,
                ..
            } => Some(vec![
                ("username", username.clone()),
                ("client_id", client_id.clone()),
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
            ]),
            _ => None,
        }
    }

    /// Password grant body carrying a `newPassword` field.
    pub fn password_change_form(&self, new_password: &str) -> Result<Form, AuthError> {
        if !matches!(self, Grant::Password { .. }) {
            return Err(AuthError::PasswordPolicy(format!(
                "password change requires the password grant, configured grant is {}",
                self.kind()
            )));
        }
        let mut form = self.token_form()?;
        form.push(("newPassword", new_password.to_string()));
        Ok(form)
    }

    /// Make `new_password` the password used by later requests.
    pub fn set_password(&mut self, new_password: &str) {
        if let Grant::Password { password, .. } = self {
            *password = new_password.to_string();
        }
    }
}
