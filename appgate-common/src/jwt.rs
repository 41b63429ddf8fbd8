//! Signing and verification of the short-lived JWTs injected into forwarded
//! application requests.
//!
//! The upstream application authenticates the end user from the token alone,
//! so the claim schema is a wire contract: subject and `username` carry the
//! user, the issuer is the cluster, the audience is the application URI.
//!
//! Signing uses ES256. In-memory keys go through `jsonwebtoken`; opaque
//! (hardware-resident) keys cannot hand their material to `jsonwebtoken`, so
//! the JWS is assembled by hand over the generic signer.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::keys::{PrivateKey, PublicKey};

/// Tokens are valid slightly before their issue time to absorb clock skew.
pub const CLOCK_SKEW_LEEWAY: Duration = Duration::from_secs(10);

/// The claims carried by an application JWT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user the token asserts.
    pub sub: String,
    /// Issuer: the cluster name.
    pub iss: String,
    /// Audience: the application URI.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aud: Vec<String>,
    /// Not valid before, seconds since epoch.
    pub nbf: u64,
    /// Issued at, seconds since epoch.
    pub iat: u64,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    /// The asserted username, duplicated out of `sub` for convenience.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Roles held by the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// User traits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub traits: BTreeMap<String, Vec<String>>,
}

/// Parameters for [`Key::sign`].
#[derive(Debug, Clone)]
pub struct SignParams {
    /// The user the token asserts.
    pub username: String,
    /// Roles held by the user.
    pub roles: Vec<String>,
    /// User traits.
    pub traits: BTreeMap<String, Vec<String>>,
    /// Token expiry.
    pub expires: SystemTime,
    /// The application URI the token is scoped to.
    pub uri: String,
}

/// Parameters for [`Key::verify`].
#[derive(Debug, Clone)]
pub struct VerifyParams {
    /// Expected subject.
    pub username: String,
    /// The encoded token.
    pub raw_token: String,
    /// Expected audience.
    pub uri: String,
}

/// Parameters for [`Key::sign_snowflake`].
#[derive(Debug, Clone)]
pub struct SnowflakeSignParams {
    /// Snowflake account name.
    pub account: String,
    /// Snowflake login name.
    pub login: String,
    /// Token expiry.
    pub expires: SystemTime,
}

/// Parameters for [`Key::verify_snowflake`].
#[derive(Debug, Clone)]
pub struct SnowflakeVerifyParams {
    /// Snowflake account name.
    pub account: String,
    /// Snowflake login name.
    pub login: String,
    /// The encoded token.
    pub raw_token: String,
}

/// Configuration of a JWT [`Key`].
pub struct Config {
    /// Name of the issuing cluster.
    pub cluster_name: String,
    /// Private key; absent for verify-only keys.
    pub private_key: Option<PrivateKey>,
    /// Public key; derived from the private key when absent.
    pub public_key: Option<PublicKey>,
}

/// A JWT signing/verification key scoped to one cluster.
#[derive(Debug)]
pub struct Key {
    cluster_name: String,
    private: Option<PrivateKey>,
    public: PublicKey,
}

impl Key {
    /// Build a key from its configuration.
    pub fn new(config: Config) -> Result<Self> {
        if config.cluster_name.is_empty() {
            return Err(Error::bad_parameter("cluster name is missing"));
        }
        let public = match (&config.public_key, &config.private_key) {
            (Some(public), _) => public.clone(),
            (None, Some(private)) => private.public_key(),
            (None, None) => {
                return Err(Error::bad_parameter(
                    "either a private or a public key is required",
                ))
            }
        };
        if !matches!(public, PublicKey::P256(_)) {
            return Err(Error::bad_parameter(
                "application JWTs require an ECDSA P-256 key",
            ));
        }
        Ok(Self {
            cluster_name: config.cluster_name,
            private: config.private_key,
            public,
        })
    }

    /// Sign an application token.
    pub fn sign(&self, params: &SignParams) -> Result<String> {
        if params.username.is_empty() {
            return Err(Error::bad_parameter("username is missing"));
        }
        if params.roles.is_empty() {
            return Err(Error::bad_parameter("roles are missing"));
        }
        if params.uri.is_empty() {
            return Err(Error::bad_parameter("uri is missing"));
        }
        if params.expires == UNIX_EPOCH {
            return Err(Error::bad_parameter("expiry is missing"));
        }

        let now = unix_seconds(SystemTime::now());
        let claims = Claims {
            sub: params.username.clone(),
            iss: self.cluster_name.clone(),
            aud: vec![params.uri.clone()],
            nbf: now.saturating_sub(CLOCK_SKEW_LEEWAY.as_secs()),
            iat: now,
            exp: unix_seconds(params.expires),
            username: params.username.clone(),
            roles: params.roles.clone(),
            traits: params.traits.clone(),
        };
        self.encode(&claims)
    }

    /// Verify an application token and return its claims.
    pub fn verify(&self, params: &VerifyParams) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&self.cluster_name]);
        validation.set_audience(&[&params.uri]);
        validation.sub = Some(params.username.clone());
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
        self.decode(&params.raw_token, validation)
    }

    /// Sign a Snowflake token: issuer and subject follow the Snowflake
    /// key-pair JWT convention, no audience is set.
    pub fn sign_snowflake(&self, params: &SnowflakeSignParams) -> Result<String> {
        if params.account.is_empty() || params.login.is_empty() {
            return Err(Error::bad_parameter("account and login are required"));
        }
        let subject = snowflake_subject(&params.account, &params.login);
        let issuer = format!("{subject}.{}", self.public_key_fingerprint()?);

        let now = unix_seconds(SystemTime::now());
        let nbf = now.saturating_sub(CLOCK_SKEW_LEEWAY.as_secs());
        let claims = Claims {
            sub: subject,
            iss: issuer,
            aud: vec![],
            nbf,
            iat: nbf,
            exp: unix_seconds(params.expires),
            username: String::new(),
            roles: vec![],
            traits: BTreeMap::new(),
        };
        self.encode(&claims)
    }

    /// Verify a Snowflake token and return its claims.
    pub fn verify_snowflake(&self, params: &SnowflakeVerifyParams) -> Result<Claims> {
        let subject = snowflake_subject(&params.account, &params.login);
        let issuer = format!("{subject}.{}", self.public_key_fingerprint()?);

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[issuer]);
        validation.sub = Some(subject);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        self.decode(&params.raw_token, validation)
    }

    /// `SHA256:<base64(sha256(DER(pub)))>` per the Snowflake convention.
    fn public_key_fingerprint(&self) -> Result<String> {
        let der = self.public.to_spki_der()?;
        let digest = Sha256::digest(&der);
        Ok(format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(digest)
        ))
    }

    fn encode(&self, claims: &Claims) -> Result<String> {
        let private = self
            .private
            .as_ref()
            .ok_or_else(|| Error::bad_parameter("this key cannot sign, no private material"))?;

        if private.is_hardware() {
            return self.encode_opaque(claims, private);
        }

        let pem = private.pkcs8_pem()?;
        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| Error::bad_parameter(format!("unusable signing key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), claims, &encoding_key)
            .map_err(|e| Error::Internal(anyhow::anyhow!("signing token: {e}")))
    }

    /// Assemble the JWS by hand for keys whose material is not extractable.
    fn encode_opaque(&self, claims: &Claims, private: &PrivateKey) -> Result<String> {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = serde_json::json!({"alg": "ES256", "typ": "JWT"});
        let signing_input = format!(
            "{}.{}",
            b64.encode(serde_json::to_vec(&header).expect("static header")),
            b64.encode(
                serde_json::to_vec(claims)
                    .map_err(|e| Error::Internal(anyhow::anyhow!("encoding claims: {e}")))?
            ),
        );
        let signature = private.signer().sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{}", b64.encode(signature)))
    }

    fn decode(&self, raw_token: &str, validation: Validation) -> Result<Claims> {
        let pem = self.public.to_spki_pem()?;
        let decoding_key = DecodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| Error::bad_parameter(format!("unusable verification key: {e}")))?;
        let data = jsonwebtoken::decode::<Claims>(raw_token, &decoding_key, &validation)
            .map_err(|e| Error::access_denied(format!("invalid token: {e}")))?;
        Ok(data.claims)
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn snowflake_subject(account: &str, login: &str) -> String {
    format!(
        "{}.{}",
        account.to_uppercase(),
        login.to_uppercase()
    )
}
