//! Application records (`AppV3`): the resources the proxy advertises and
//! forwards traffic to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::labels::{combine_labels, CommandLabel};
use crate::resource::{is_valid_label_key, Kind, Metadata, Resource, ResourceWithLabels};
use crate::utils::deduplicate_by;

/// Schema version of [`AppV3`].
pub const V3: &str = "v3";

/// Application protocols derived from the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain HTTP(S) application.
    Http,
    /// Raw TCP application.
    Tcp,
}

/// `public_addr` host prefixes reserved for internal routing.
pub const RESERVED_PUBLIC_ADDR_PREFIXES: &[&str] = &["kube."];

/// The AWS console landing URLs an application URI is matched against.
pub const AWS_CONSOLE_URLS: &[&str] = &[
    "https://console.aws.amazon.com",
    "https://console.amazonaws.cn",
    "https://console.amazonaws-us-gov.com",
];

/// A single header rewrite applied to forwarded requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name.
    pub name: String,
    /// Header value; may reference user traits.
    pub value: String,
}

/// Rewrite rules applied by the HTTP forwarder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    /// Hosts whose redirect `Location` is rewritten back to the public
    /// address.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect: Vec<String>,
    /// Extra headers set on forwarded requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
}

/// AWS-specific application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAws {
    /// External id passed when assuming roles in external accounts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_id: String,
}

/// The specification of an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSpecV3 {
    /// Address the application runs at, e.g. `http://backend:8080` or
    /// `tcp://db:5432`.
    pub uri: String,
    /// Address clients connect to; defaults to `<name>.<proxy public addr>`
    /// when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_addr: String,
    /// Skip upstream TLS verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Labels computed by periodically running commands.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dynamic_labels: BTreeMap<String, CommandLabel>,
    /// Request/response rewrite rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<Rewrite>,
    /// AWS settings, for console applications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AppAws>,
}

/// An application resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppV3 {
    /// Wire kind, always `app`.
    pub kind: Kind,
    /// Schema version, always `v3`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Application specification.
    pub spec: AppSpecV3,
}

impl AppV3 {
    /// Build a new application, validating and filling defaults.
    pub fn new(metadata: Metadata, spec: AppSpecV3) -> Result<Self> {
        let mut app = Self {
            kind: Kind::App,
            version: V3.to_string(),
            metadata,
            spec,
        };
        app.check_and_set_defaults()?;
        Ok(app)
    }

    /// Validate the application and fill defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::App;
        if self.version.is_empty() {
            self.version = V3.to_string();
        }
        self.metadata.check_and_set_defaults()?;

        if self.spec.uri.is_empty() {
            return Err(Error::bad_parameter(format!(
                "app {:?} is missing a uri",
                self.metadata.name
            )));
        }
        if !self.spec.public_addr.is_empty() {
            let host = self
                .spec
                .public_addr
                .split(':')
                .next()
                .unwrap_or(&self.spec.public_addr);
            for prefix in RESERVED_PUBLIC_ADDR_PREFIXES {
                if host.starts_with(prefix) {
                    return Err(Error::bad_parameter(format!(
                        "app {:?} public_addr {:?} uses reserved prefix {prefix:?}",
                        self.metadata.name, self.spec.public_addr
                    )));
                }
            }
        }
        for (key, label) in &self.spec.dynamic_labels {
            if !is_valid_label_key(key) {
                return Err(Error::bad_parameter(format!(
                    "invalid dynamic label key {key:?}"
                )));
            }
            label.check()?;
        }
        Ok(())
    }

    /// True if the application speaks raw TCP.
    pub fn is_tcp(&self) -> bool {
        self.spec.uri.starts_with("tcp://")
    }

    /// The protocol derived from the URI scheme.
    pub fn protocol(&self) -> Protocol {
        if self.is_tcp() {
            Protocol::Tcp
        } else {
            Protocol::Http
        }
    }

    /// True if the URI points at one of the AWS console landing pages.
    pub fn is_aws_console(&self) -> bool {
        AWS_CONSOLE_URLS
            .iter()
            .any(|console| self.spec.uri.starts_with(console))
    }

    /// The AWS external id, if configured.
    pub fn aws_external_id(&self) -> Option<&str> {
        self.spec
            .aws
            .as_ref()
            .map(|aws| aws.external_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// The address clients use; falls back to the name when unset.
    pub fn public_addr(&self) -> &str {
        if self.spec.public_addr.is_empty() {
            &self.metadata.name
        } else {
            &self.spec.public_addr
        }
    }
}

impl Resource for AppV3 {
    fn kind(&self) -> Kind {
        Kind::App
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl ResourceWithLabels for AppV3 {
    fn all_labels(&self) -> BTreeMap<String, String> {
        combine_labels(&self.metadata.labels, &self.spec.dynamic_labels)
    }

    fn search_fields(&self) -> Vec<String> {
        vec![
            self.metadata.name.clone(),
            self.metadata.description.clone(),
            self.spec.public_addr.clone(),
            self.spec.uri.clone(),
        ]
    }
}

/// Remove duplicate applications keyed by `(name, public_addr)`, preserving
/// first-seen order.
pub fn deduplicate_apps(apps: Vec<AppV3>) -> Vec<AppV3> {
    deduplicate_by(apps, |app| {
        (app.metadata.name.clone(), app.spec.public_addr.clone())
    })
}
