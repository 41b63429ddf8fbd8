//! RBAC roles: allow/deny conditions, options and versioned defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::labels::{duration_secs, Labels};
use crate::resource::{Kind, Metadata, Resource};

/// Default TTL of certificates issued under a role.
pub const DEFAULT_MAX_SESSION_TTL: Duration = Duration::from_secs(30 * 60 * 60);

/// Default session-recording mode.
pub const DEFAULT_RECORD_SESSION_MODE: &str = "best_effort";

/// The wildcard label selector.
pub const WILDCARD: &str = "*";

/// A kubernetes resource a role grants access to (V6).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeResource {
    /// Resource kind, e.g. `pod`.
    pub kind: String,
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Resource name; `*` matches all.
    pub name: String,
}

/// Who a role holder may impersonate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonateConditions {
    /// Users that can be impersonated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    /// Roles that can be assumed while impersonating.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl ImpersonateConditions {
    /// True when either users or roles is empty.
    ///
    /// Note the asymmetry: a conditions block with users but no roles is not
    /// "empty", it is invalid, and [`RoleV6::check_and_set_defaults`] rejects
    /// exactly that case.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() || self.roles.is_empty()
    }
}

/// What a role holder may request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequestConditions {
    /// Roles that can be requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Search-based resource request allowance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_as_roles: Vec<String>,
}

impl AccessRequestConditions {
    /// True when no request allowances are present.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.search_as_roles.is_empty()
    }
}

/// Which access requests a role holder may review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReviewConditions {
    /// Roles whose requests can be reviewed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Roles assumed while previewing requested resources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preview_as_roles: Vec<String>,
}

/// A session-join allowance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJoinPolicy {
    /// Policy name.
    pub name: String,
    /// Roles whose sessions may be joined.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Session kinds the policy covers, e.g. `ssh`, `k8s`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    /// Participation modes, e.g. `observer`, `peer`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<String>,
}

/// One side (allow or deny) of a role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleConditions {
    /// OS logins granted on nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logins: Vec<String>,
    /// Node label selectors.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub node_labels: Labels,
    /// Application label selectors.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub app_labels: Labels,
    /// Database label selectors.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub db_labels: Labels,
    /// Kubernetes cluster label selectors.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub kube_labels: Labels,
    /// Windows desktop label selectors.
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub windows_desktop_labels: Labels,
    /// Kubernetes users the role maps to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kube_users: Vec<String>,
    /// Kubernetes groups the role maps to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kube_groups: Vec<String>,
    /// Kubernetes resources (V6).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kube_resources: Vec<KubeResource>,
    /// AWS role ARNs assumable through console apps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aws_role_arns: Vec<String>,
    /// Azure identities assumable through the proxy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azure_identities: Vec<String>,
    /// Impersonation allowances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonate: Option<ImpersonateConditions>,
    /// Access-request allowances; absent and empty behave identically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AccessRequestConditions>,
    /// Access-review allowances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_requests: Option<AccessReviewConditions>,
    /// Session-join policies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join_sessions: Vec<SessionJoinPolicy>,
}

impl RoleConditions {
    /// Access-request allowances, with empty conditions acting as absent.
    pub fn access_request_conditions(&self) -> Option<&AccessRequestConditions> {
        self.request.as_ref().filter(|c| !c.is_empty())
    }
}

/// Session-recording options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSession {
    /// Recording mode, `best_effort` or `strict`.
    pub default_mode: String,
    /// Whether desktop sessions are recorded.
    pub desktop: bool,
}

impl Default for RecordSession {
    fn default() -> Self {
        Self {
            default_mode: DEFAULT_RECORD_SESSION_MODE.to_string(),
            desktop: true,
        }
    }
}

/// Role options applied to sessions created under the role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleOptions {
    /// Maximum TTL of issued certificates.
    #[serde(with = "duration_secs")]
    pub max_session_ttl: Duration,
    /// Whether port forwarding is allowed.
    pub port_forwarding: bool,
    /// Session-recording options.
    pub record_session: RecordSession,
    /// Require MFA per session.
    pub require_session_mfa: bool,
    /// Disconnect clients when their certificate expires.
    pub disconnect_expired_cert: bool,
    /// Disconnect idle clients after this long; zero disables.
    #[serde(with = "duration_secs")]
    pub client_idle_timeout: Duration,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            max_session_ttl: DEFAULT_MAX_SESSION_TTL,
            port_forwarding: true,
            record_session: RecordSession::default(),
            require_session_mfa: false,
            disconnect_expired_cert: false,
            client_idle_timeout: Duration::ZERO,
        }
    }
}

/// The specification of a [`RoleV6`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Conditions that grant access.
    #[serde(default)]
    pub allow: RoleConditions,
    /// Conditions that remove access; deny wins over allow.
    #[serde(default)]
    pub deny: RoleConditions,
    /// Session options.
    #[serde(default)]
    pub options: RoleOptions,
}

/// An RBAC role. The struct carries every schema version; defaults differ
/// per version (see [`RoleV6::check_and_set_defaults`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleV6 {
    /// Wire kind, always `role`.
    pub kind: Kind,
    /// Schema version, `v3` through `v6`.
    pub version: String,
    /// Shared metadata.
    pub metadata: Metadata,
    /// Role specification.
    pub spec: RoleSpec,
}

impl RoleV6 {
    /// Build a new role at the given version.
    pub fn new(version: &str, metadata: Metadata, spec: RoleSpec) -> Result<Self> {
        let mut role = Self {
            kind: Kind::Role,
            version: version.to_string(),
            metadata,
            spec,
        };
        role.check_and_set_defaults()?;
        Ok(role)
    }

    /// Validate the role and fill version-dependent defaults.
    pub fn check_and_set_defaults(&mut self) -> Result<()> {
        self.kind = Kind::Role;
        if self.version.is_empty() {
            self.version = "v6".to_string();
        }
        if !matches!(self.version.as_str(), "v3" | "v4" | "v5" | "v6") {
            return Err(Error::bad_parameter(format!(
                "unsupported role version {:?}",
                self.version
            )));
        }
        self.metadata.check_and_set_defaults()?;

        // V3 grants access to everything unless told otherwise; V4 and later
        // start closed.
        if self.version == "v3" {
            let wildcard = Labels::from([(WILDCARD, &[WILDCARD][..])]);
            for labels in [
                &mut self.spec.allow.node_labels,
                &mut self.spec.allow.app_labels,
                &mut self.spec.allow.db_labels,
                &mut self.spec.allow.kube_labels,
                &mut self.spec.allow.windows_desktop_labels,
            ] {
                if labels.is_empty() {
                    *labels = wildcard.clone();
                }
            }
        }

        for (what, values) in [
            ("logins", &self.spec.allow.logins),
            ("aws_role_arns", &self.spec.allow.aws_role_arns),
            ("azure_identities", &self.spec.allow.azure_identities),
        ] {
            if values.iter().any(|v| v == WILDCARD) {
                return Err(Error::bad_parameter(format!(
                    "role {:?}: wildcard is not allowed in allow.{what}",
                    self.metadata.name
                )));
            }
        }

        for conditions in [&self.spec.allow, &self.spec.deny] {
            for labels in [
                &conditions.node_labels,
                &conditions.app_labels,
                &conditions.db_labels,
                &conditions.kube_labels,
                &conditions.windows_desktop_labels,
            ] {
                check_wildcard_selector(labels)?;
            }
            if let Some(impersonate) = &conditions.impersonate {
                if !impersonate.users.is_empty() && impersonate.roles.is_empty() {
                    return Err(Error::bad_parameter(format!(
                        "role {:?}: impersonate.roles must be set when impersonate.users is set",
                        self.metadata.name
                    )));
                }
            }
        }

        if self.version == "v6" {
            for resource in &self.spec.allow.kube_resources {
                if resource.namespace.is_empty() || resource.name.is_empty() {
                    return Err(Error::bad_parameter(format!(
                        "role {:?}: kubernetes resources require both namespace and name",
                        self.metadata.name
                    )));
                }
            }
        }

        if self.spec.options.max_session_ttl.is_zero() {
            self.spec.options.max_session_ttl = DEFAULT_MAX_SESSION_TTL;
        }
        if self.spec.options.record_session.default_mode.is_empty() {
            self.spec.options.record_session.default_mode =
                DEFAULT_RECORD_SESSION_MODE.to_string();
        }
        Ok(())
    }
}

/// Reject selectors using the wildcard key with non-wildcard values:
/// `*: x` is only legal as `*: *`.
fn check_wildcard_selector(labels: &Labels) -> Result<()> {
    if let Some(values) = labels.get(WILDCARD) {
        if values != [WILDCARD.to_string()] {
            return Err(Error::bad_parameter(
                "selector *:<value> is only supported as *:*",
            ));
        }
    }
    Ok(())
}

impl Resource for RoleV6 {
    fn kind(&self) -> Kind {
        Kind::Role
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

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Metadata {
        Metadata {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn v3_defaults_labels_to_wildcard() {
        let role = RoleV6::new("v3", named("dev"), RoleSpec::default()).unwrap();
        assert_eq!(
            role.spec.allow.app_labels.get(WILDCARD).unwrap(),
            [WILDCARD.to_string()]
        );
        assert_eq!(
            role.spec.allow.node_labels.get(WILDCARD).unwrap(),
            [WILDCARD.to_string()]
        );
    }

    #[test]
    fn v4_leaves_labels_empty() {
        let role = RoleV6::new("v4", named("dev"), RoleSpec::default()).unwrap();
        assert!(role.spec.allow.app_labels.is_empty());
    }

    #[test]
    fn wildcard_login_is_rejected() {
        let mut spec = RoleSpec::default();
        spec.allow.logins = vec!["root".to_string(), "*".to_string()];
        let err = RoleV6::new("v5", named("dev"), spec).unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[test]
    fn wildcard_arn_is_rejected() {
        let mut spec = RoleSpec::default();
        spec.allow.aws_role_arns = vec!["*".to_string()];
        assert!(RoleV6::new("v5", named("dev"), spec).is_err());
    }

    #[test]
    fn wildcard_selector_requires_wildcard_value() {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["prod"][..])]);
        let err = RoleV6::new("v5", named("dev"), spec).unwrap_err();
        assert!(err.is_bad_parameter());

        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["*"][..])]);
        assert!(RoleV6::new("v5", named("dev"), spec).is_ok());
    }

    #[test]
    fn impersonate_users_without_roles_is_rejected() {
        let mut spec = RoleSpec::default();
        spec.allow.impersonate = Some(ImpersonateConditions {
            users: vec!["alice".to_string()],
            roles: vec![],
        });
        assert!(RoleV6::new("v5", named("dev"), spec).is_err());

        // Roles without users is tolerated even though is_empty() is true.
        let mut spec = RoleSpec::default();
        spec.allow.impersonate = Some(ImpersonateConditions {
            users: vec![],
            roles: vec!["auditor".to_string()],
        });
        assert!(RoleV6::new("v5", named("dev"), spec).is_ok());
    }

    #[test]
    fn v6_validates_kube_resources() {
        let mut spec = RoleSpec::default();
        spec.allow.kube_resources = vec![KubeResource {
            kind: "pod".to_string(),
            namespace: String::new(),
            name: "web".to_string(),
        }];
        assert!(RoleV6::new("v6", named("dev"), spec.clone()).is_err());
        // V5 does not know about kube resources and skips the check.
        assert!(RoleV6::new("v5", named("dev"), spec).is_ok());
    }

    #[test]
    fn options_defaults() {
        let role = RoleV6::new("v6", named("dev"), RoleSpec::default()).unwrap();
        assert_eq!(role.spec.options.max_session_ttl, DEFAULT_MAX_SESSION_TTL);
        assert!(role.spec.options.port_forwarding);
        assert_eq!(
            role.spec.options.record_session.default_mode,
            DEFAULT_RECORD_SESSION_MODE
        );
    }

    #[test]
    fn empty_request_conditions_act_as_absent() {
        let mut conditions = RoleConditions::default();
        assert!(conditions.access_request_conditions().is_none());
        conditions.request = Some(AccessRequestConditions::default());
        assert!(conditions.access_request_conditions().is_none());
        conditions.request = Some(AccessRequestConditions {
            roles: vec!["dba".to_string()],
            search_as_roles: vec![],
        });
        assert!(conditions.access_request_conditions().is_some());
    }
}
