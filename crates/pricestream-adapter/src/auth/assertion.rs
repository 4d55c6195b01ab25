/*
[INPUT]:  Private JWK (RSA, EC P-256/384/521 or OKP Ed25519) and client identity
[OUTPUT]: Signed JWT client assertions (RS*, PS*, ES*, EdDSA)
[POS]:    Auth layer - signing for the JWT-bearer grant
[UPDATE]: When supporting other key types or changing assertion claims
*/

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer};
use rsa::{BigUint, RsaPrivateKey, pkcs1v15, pss};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::http::AuthError;

/// Lifetime of a client assertion
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// JSON Web Key as stored in the key file
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    /// Private exponent (RSA) or private scalar (EC, OKP)
    #[serde(default)]
    pub d: Option<String>,
    /// Public key (OKP) or x coordinate (EC)
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub p: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
}

/// JWS `alg` values a client assertion can be signed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    Rs256,
    Rs384,
    Rs512,
    Ps256,
    Ps384,
    Ps512,
    Es256,
    Es384,
    Es512,
    EdDsa,
}

impl JwsAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            JwsAlgorithm::Rs256 => "RS256",
            JwsAlgorithm::Rs384 => "RS384",
            JwsAlgorithm::Rs512 => "RS512",
            JwsAlgorithm::Ps256 => "PS256",
            JwsAlgorithm::Ps384 => "PS384",
            JwsAlgorithm::Ps512 => "PS512",
            JwsAlgorithm::Es256 => "ES256",
            JwsAlgorithm::Es384 => "ES384",
            JwsAlgorithm::Es512 => "ES512",
            JwsAlgorithm::EdDsa => "EdDSA",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let alg = match name {
            "RS256" => JwsAlgorithm::Rs256,
            "RS384" => JwsAlgorithm::Rs384,
            "RS512" => JwsAlgorithm::Rs512,
            "PS256" => JwsAlgorithm::Ps256,
            "PS384" => JwsAlgorithm::Ps384,
            "PS512" => JwsAlgorithm::Ps512,
            "ES256" => JwsAlgorithm::Es256,
            "ES384" => JwsAlgorithm::Es384,
            "ES512" => JwsAlgorithm::Es512,
            "EdDSA" => JwsAlgorithm::EdDsa,
            _ => return None,
        };
        Some(alg)
    }

    fn is_rsa(self) -> bool {
        matches!(
            self,
            JwsAlgorithm::Rs256
                | JwsAlgorithm::Rs384
                | JwsAlgorithm::Rs512
                | JwsAlgorithm::Ps256
                | JwsAlgorithm::Ps384
                | JwsAlgorithm::Ps512
        )
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum KeyMaterial {
    Rsa(RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

#[derive(Serialize)]
struct Header<'a> {
    alg: &'static str,
    typ: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Signs JWT client assertions with the key from a JWK
#[derive(Clone)]
pub struct AssertionSigner {
    key: Arc<KeyMaterial>,
    alg: JwsAlgorithm,
    kid: Option<String>,
}

impl fmt::Debug for AssertionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionSigner")
            .field("alg", &self.alg)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

fn jwt_error(message: impl Into<String>) -> AuthError {
    AuthError::Jwt(message.into())
}

/// Decode a required base64url JWK member.
fn component(value: Option<&str>, name: &str) -> Result<Vec<u8>, AuthError> {
    let value = value.ok_or_else(|| jwt_error(format!("key has no `{name}` component")))?;
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| jwt_error(format!("invalid `{name}` encoding: {e}")))
}

impl AssertionSigner {
    /// Ed25519 signer from existing secret key bytes (32 bytes)
    pub fn from_secret_key(bytes: &[u8; 32], kid: Option<String>) -> Self {
        Self {
            key: Arc::new(KeyMaterial::Ed25519(ed25519_dalek::SigningKey::from_bytes(bytes))),
            alg: JwsAlgorithm::EdDsa,
            kid,
        }
    }

    /// Build a signer from a private JWK. The header `alg` is the JWK's own
    /// `alg`, or the usual one for the key type when the JWK has none.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, AuthError> {
        let requested = match jwk.alg.as_deref() {
            Some(name) => Some(
                JwsAlgorithm::from_name(name)
                    .ok_or_else(|| jwt_error(format!("unsupported algorithm {name}")))?,
            ),
            None => None,
        };

        let (key, alg) = match jwk.kty.as_str() {
            "RSA" => rsa_key(jwk, requested)?,
            "EC" => ec_key(jwk, requested)?,
            "OKP" => okp_key(jwk, requested)?,
            other => return Err(jwt_error(format!("unsupported key type {other}"))),
        };

        Ok(Self {
            key: Arc::new(key),
            alg,
            kid: jwk.kid.clone(),
        })
    }

    pub fn from_jwk_json(json: &str) -> Result<Self, AuthError> {
        let jwk: Jwk = serde_json::from_str(json).map_err(|e| jwt_error(format!("invalid JWK: {e}")))?;
        Self::from_jwk(&jwk)
    }

    pub fn from_jwk_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| jwt_error(format!("failed to read {}: {e}", path.display())))?;
        Self::from_jwk_json(&json)
    }

    pub fn algorithm(&self) -> JwsAlgorithm {
        self.alg
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Build and sign a compact JWS for the client-credentials assertion.
    pub fn sign(&self, client_id: &str, audience: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let header = Header {
            alg: self.alg.as_str(),
            typ: "JWT",
            kid: self.kid.as_deref(),
        };
        let iat = now.timestamp();
        let claims = Claims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: audience.to_string(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let header = serde_json::to_vec(&header).map_err(|e| jwt_error(e.to_string()))?;
        let claims = serde_json::to_vec(&claims).map_err(|e| jwt_error(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = self.signature(signing_input.as_bytes())?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Raw JWS signature bytes; ECDSA signatures are fixed-width `r || s`.
    fn signature(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let failed = |e: rsa::signature::Error| jwt_error(format!("signing failed: {e}"));
        let bytes = match (&*self.key, self.alg) {
            (KeyMaterial::Rsa(key), JwsAlgorithm::Rs256) => pkcs1v15::SigningKey::<Sha256>::new(key.clone())
                .try_sign(input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::Rsa(key), JwsAlgorithm::Rs384) => pkcs1v15::SigningKey::<Sha384>::new(key.clone())
                .try_sign(input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::Rsa(key), JwsAlgorithm::Rs512) => pkcs1v15::SigningKey::<Sha512>::new(key.clone())
                .try_sign(input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::Rsa(key), JwsAlgorithm::Ps256) => pss::BlindedSigningKey::<Sha256>::new(key.clone())
                .try_sign_with_rng(&mut OsRng, input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::Rsa(key), JwsAlgorithm::Ps384) => pss::BlindedSigningKey::<Sha384>::new(key.clone())
                .try_sign_with_rng(&mut OsRng, input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::Rsa(key), JwsAlgorithm::Ps512) => pss::BlindedSigningKey::<Sha512>::new(key.clone())
                .try_sign_with_rng(&mut OsRng, input)
                .map_err(failed)?
                .to_vec(),
            (KeyMaterial::P256(key), JwsAlgorithm::Es256) => {
                let signature: p256::ecdsa::Signature = key.try_sign(input).map_err(failed)?;
                signature.to_bytes().to_vec()
            }
            (KeyMaterial::P384(key), JwsAlgorithm::Es384) => {
                let signature: p384::ecdsa::Signature = key.try_sign(input).map_err(failed)?;
                signature.to_bytes().to_vec()
            }
            (KeyMaterial::P521(key), JwsAlgorithm::Es512) => {
                let signature: p521::ecdsa::Signature = key.try_sign(input).map_err(failed)?;
                signature.to_bytes().to_vec()
            }
            (KeyMaterial::Ed25519(key), JwsAlgorithm::EdDsa) => {
                let signature: ed25519_dalek::Signature = key.try_sign(input).map_err(failed)?;
                signature.to_bytes().to_vec()
            }
            (_, alg) => return Err(jwt_error(format!("algorithm {alg} does not match the key"))),
        };
        Ok(bytes)
    }
}

fn rsa_key(jwk: &Jwk, requested: Option<JwsAlgorithm>) -> Result<(KeyMaterial, JwsAlgorithm), AuthError> {
    let alg = requested.unwrap_or(JwsAlgorithm::Rs256);
    if !alg.is_rsa() {
        return Err(jwt_error(format!("algorithm {alg} cannot be used with an RSA key")));
    }

    let uint = |value: &Option<String>, name: &str| {
        component(value.as_deref(), name).map(|bytes| BigUint::from_bytes_be(&bytes))
    };
    let key = RsaPrivateKey::from_components(
        uint(&jwk.n, "n")?,
        uint(&jwk.e, "e")?,
        uint(&jwk.d, "d")?,
        vec![uint(&jwk.p, "p")?, uint(&jwk.q, "q")?],
    )
    .map_err(|e| jwt_error(format!("invalid RSA key: {e}")))?;
    key.validate()
        .map_err(|e| jwt_error(format!("invalid RSA key: {e}")))?;

    Ok((KeyMaterial::Rsa(key), alg))
}

fn ec_key(jwk: &Jwk, requested: Option<JwsAlgorithm>) -> Result<(KeyMaterial, JwsAlgorithm), AuthError> {
    let crv = jwk
        .crv
        .as_deref()
        .ok_or_else(|| jwt_error("EC key has no curve"))?;
    let expected = match crv {
        "P-256" => JwsAlgorithm::Es256,
        "P-384" => JwsAlgorithm::Es384,
        "P-521" => JwsAlgorithm::Es512,
        other => return Err(jwt_error(format!("unsupported curve {other}"))),
    };
    if let Some(alg) = requested
        && alg != expected
    {
        return Err(jwt_error(format!("algorithm {alg} cannot be used with curve {crv}")));
    }

    let d = component(jwk.d.as_deref(), "d")?;
    let invalid = || jwt_error(format!("invalid {crv} private key"));
    let key = match expected {
        JwsAlgorithm::Es256 => {
            KeyMaterial::P256(p256::ecdsa::SigningKey::from_slice(&d).map_err(|_| invalid())?)
        }
        JwsAlgorithm::Es384 => {
            KeyMaterial::P384(p384::ecdsa::SigningKey::from_slice(&d).map_err(|_| invalid())?)
        }
        _ => KeyMaterial::P521(p521::ecdsa::SigningKey::from_slice(&d).map_err(|_| invalid())?),
    };
    Ok((key, expected))
}

fn okp_key(jwk: &Jwk, requested: Option<JwsAlgorithm>) -> Result<(KeyMaterial, JwsAlgorithm), AuthError> {
    if let Some(crv) = jwk.crv.as_deref()
        && crv != "Ed25519"
    {
        return Err(jwt_error(format!("unsupported curve {crv}")));
    }
    if let Some(alg) = requested
        && alg != JwsAlgorithm::EdDsa
    {
        return Err(jwt_error(format!("algorithm {alg} cannot be used with an Ed25519 key")));
    }

    let d = component(jwk.d.as_deref(), "d")?;
    let secret: [u8; 32] = d
        .as_slice()
        .try_into()
        .map_err(|_| jwt_error(format!("private key must be 32 bytes, got {}", d.len())))?;
    let key = ed25519_dalek::SigningKey::from_bytes(&secret);

    if let Some(x) = jwk.x.as_deref() {
        let public = component(Some(x), "x")?;
        if public != key.verifying_key().to_bytes() {
            return Err(jwt_error("public key does not match private key"));
        }
    }

    Ok((KeyMaterial::Ed25519(key), JwsAlgorithm::EdDsa))
}
