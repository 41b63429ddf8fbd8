//! Agent configuration, loaded from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use appgate_common::app::{AppAws, AppSpecV3, AppV3, Header, Rewrite};
use appgate_common::errors::{Error, Result};
use appgate_common::labels::{CommandLabel, Labels};
use appgate_common::resource::Metadata;

/// One header rewrite entry in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderConfig {
    /// Header name.
    pub name: String,
    /// Header value; may reference user traits.
    pub value: String,
}

/// Rewrite rules of one configured application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RewriteConfig {
    /// Hosts whose redirects are rewritten back to the public address.
    #[serde(default)]
    pub redirect: Vec<String>,
    /// Extra headers on forwarded requests.
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
}

/// One dynamic label definition in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicLabelConfig {
    /// Seconds between command runs.
    pub period_seconds: u64,
    /// The command and its arguments.
    pub command: Vec<String>,
}

/// One statically configured application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Application name.
    pub name: String,
    /// Address the application runs at.
    pub uri: String,
    /// Address clients connect to.
    #[serde(default)]
    pub public_addr: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Static labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Dynamic labels.
    #[serde(default)]
    pub dynamic_labels: BTreeMap<String, DynamicLabelConfig>,
    /// Skip upstream TLS verification for this application.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Rewrite rules.
    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,
    /// AWS external id, for console applications in external accounts.
    #[serde(default)]
    pub aws_external_id: String,
}

impl AppConfig {
    /// Convert into the stored application record.
    pub fn to_app(&self) -> Result<AppV3> {
        let dynamic_labels = self
            .dynamic_labels
            .iter()
            .map(|(name, label)| {
                (
                    name.clone(),
                    CommandLabel {
                        period: Duration::from_secs(label.period_seconds),
                        command: label.command.clone(),
                        result: String::new(),
                    },
                )
            })
            .collect();
        let rewrite = self.rewrite.as_ref().map(|rw| Rewrite {
            redirect: rw.redirect.clone(),
            headers: rw
                .headers
                .iter()
                .map(|h| Header {
                    name: h.name.clone(),
                    value: h.value.clone(),
                })
                .collect(),
        });
        let aws = if self.aws_external_id.is_empty() {
            None
        } else {
            Some(AppAws {
                external_id: self.aws_external_id.clone(),
            })
        };
        AppV3::new(
            Metadata {
                name: self.name.clone(),
                description: self.description.clone(),
                labels: self.labels.clone(),
                ..Default::default()
            },
            AppSpecV3 {
                uri: self.uri.clone(),
                public_addr: self.public_addr.clone(),
                insecure_skip_verify: self.insecure_skip_verify,
                dynamic_labels,
                rewrite,
                aws,
            },
        )
    }
}

/// Selects dynamically discovered applications by label.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceMatcher {
    /// Label selector; wildcard entries supported.
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
}

impl ResourceMatcher {
    /// The selector as a label map.
    pub fn selector(&self) -> Labels {
        Labels(self.labels.clone())
    }
}

/// The agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Directory for agent state.
    #[serde(default)]
    pub data_dir: PathBuf,
    /// Hostname announced in heartbeats.
    pub hostname: String,
    /// Host id announced in heartbeats.
    pub host_id: String,
    /// Name of the cluster the agent belongs to.
    pub cluster_name: String,
    /// TLS cipher suite names; empty keeps the library defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    /// Statically configured applications.
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    /// Matchers selecting dynamically discovered applications.
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    /// Labels imported from the cloud provider, overlaid on every heartbeat.
    #[serde(default)]
    pub cloud_labels: BTreeMap<String, String>,
    /// Force-override upstream TLS verification for every application.
    #[serde(default)]
    pub insecure_skip_verify_override: Option<bool>,
}

impl AgentConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(raw)
            .map_err(|e| Error::bad_parameter(format!("malformed agent config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::bad_parameter(format!("reading config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validate the configuration.
    pub fn check(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::bad_parameter("agent config is missing a hostname"));
        }
        if self.host_id.is_empty() {
            return Err(Error::bad_parameter("agent config is missing a host id"));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::bad_parameter(
                "agent config is missing a cluster name",
            ));
        }
        for app in &self.apps {
            app.to_app()?;
        }
        Ok(())
    }

    /// The statically configured applications as records.
    pub fn static_apps(&self) -> Result<Vec<AppV3>> {
        self.apps.iter().map(|app| app.to_app()).collect()
    }
}
