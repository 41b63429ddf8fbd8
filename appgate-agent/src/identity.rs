//! The X.509-embedded identity of an incoming client connection.
//!
//! The proxy issues clients short-lived certificates whose leaf carries a
//! JSON identity payload in a private extension. Extracting that payload is
//! the only authentication step the agent performs itself; everything else
//! is authorization.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use x509_parser::prelude::FromDer;

use appgate_common::errors::{Error, Result};

/// The private extension OID carrying the identity payload.
pub const IDENTITY_EXTENSION_OID: &[u64] = &[1, 3, 9999, 2, 1];

/// Certificate usage restricting the holder to application access.
pub const USAGE_APPS: &str = "usage:apps";

/// The identity-embedded routing tuple telling the agent which application
/// the client is addressing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteToApp {
    /// Application session id; keys the agent's session cache.
    pub session_id: String,
    /// Public address of the application being addressed.
    pub public_addr: String,
    /// Cluster the application is served from.
    pub cluster_name: String,
    /// AWS role the client wants to assume, for console applications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_role_arn: Option<String>,
}

/// The identity extracted from a client certificate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// The authenticated user.
    pub username: String,
    /// Role names held by the user.
    #[serde(default)]
    pub groups: Vec<String>,
    /// User traits.
    #[serde(default)]
    pub traits: BTreeMap<String, Vec<String>>,
    /// Where the client is headed.
    pub route_to_app: RouteToApp,
    /// Whether the session was MFA-verified.
    #[serde(default)]
    pub mfa_verified: bool,
    /// Observed client IP at the proxy.
    #[serde(default)]
    pub client_ip: String,
    /// Certificate usage restrictions.
    #[serde(default)]
    pub usage: Vec<String>,
    /// Certificate expiry; populated from the leaf, not the payload.
    #[serde(skip)]
    pub expires: Option<SystemTime>,
}

impl Identity {
    /// Validate the identity for application access.
    pub fn check(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::access_denied("client certificate carries no user"));
        }
        if self.route_to_app.public_addr.is_empty() {
            return Err(Error::access_denied(
                "client certificate carries no application route",
            ));
        }
        if !self.usage.is_empty() && !self.usage.iter().any(|u| u == USAGE_APPS) {
            return Err(Error::access_denied(
                "client certificate is not valid for application access",
            ));
        }
        Ok(())
    }

    /// The JSON payload embedded into client certificates.
    pub fn to_extension_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Identity::serialize")
    }

    /// Extract the identity from a client leaf certificate in DER form.
    pub fn from_certificate_der(der: &[u8]) -> Result<Identity> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
            .map_err(|e| Error::access_denied(format!("malformed client certificate: {e}")))?;

        let oid = x509_parser::der_parser::oid::Oid::from(IDENTITY_EXTENSION_OID)
            .expect("static oid");
        let extension = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid == oid)
            .ok_or_else(|| {
                Error::access_denied("client certificate carries no identity extension")
            })?;

        let mut identity: Identity = serde_json::from_slice(extension.value)
            .map_err(|e| Error::access_denied(format!("malformed identity payload: {e}")))?;

        let not_after = cert.validity().not_after.timestamp();
        if not_after > 0 {
            identity.expires = Some(UNIX_EPOCH + Duration::from_secs(not_after as u64));
        }
        identity.check()?;
        Ok(identity)
    }
}
