//! Authorization of incoming application connections.
//!
//! The agent authorizes against the role set carried by the identity. Deny
//! conditions are checked first and win; allow conditions must match both
//! the application's labels and every extra matcher (e.g. the requested AWS
//! role ARN for console applications).

use std::collections::BTreeMap;
use std::sync::Arc;

use appgate_common::app::AppV3;
use appgate_common::errors::{Error, Result};
use appgate_common::labels::Labels;
use appgate_common::resource::ResourceWithLabels;
use appgate_common::role::{RoleV6, WILDCARD};

use crate::identity::Identity;

/// Per-connection MFA state.
#[derive(Debug, Clone, Default)]
pub struct MfaParams {
    /// Whether the session was MFA-verified.
    pub verified: bool,
}

/// Which side of a role a matcher inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionSide {
    /// The allow conditions.
    Allow,
    /// The deny conditions.
    Deny,
}

/// An extra per-request condition evaluated against each role.
pub trait RoleMatcher: Send + Sync {
    /// True if the given side of the role satisfies the matcher.
    fn matches(&self, role: &RoleV6, side: ConditionSide) -> bool;
}

/// Matches roles that grant (or deny) a specific AWS role ARN.
pub struct AwsRoleArnMatcher(pub String);

impl RoleMatcher for AwsRoleArnMatcher {
    fn matches(&self, role: &RoleV6, side: ConditionSide) -> bool {
        let arns = match side {
            ConditionSide::Allow => &role.spec.allow.aws_role_arns,
            ConditionSide::Deny => &role.spec.deny.aws_role_arns,
        };
        arns.iter().any(|arn| arn == &self.0)
    }
}

/// True iff `resource_labels` satisfy the selector.
///
/// Every selector entry must match: the wildcard selector `*: *` matches
/// anything, a wildcard value list matches any value, and an empty selector
/// matches nothing.
pub fn match_labels(selector: &Labels, resource_labels: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    for (key, values) in &selector.0 {
        if key == WILDCARD {
            // Validation guarantees the value is the wildcard too.
            continue;
        }
        let found = match resource_labels.get(key) {
            Some(value) => {
                values.iter().any(|v| v == WILDCARD) || values.iter().any(|v| v == value)
            }
            None => false,
        };
        if !found {
            return false;
        }
    }
    true
}

/// Session limits derived from the role set, enforced by the connection
/// monitor.
#[derive(Debug, Clone, Default)]
pub struct SessionLimits {
    /// Disconnect after this much inactivity; `None` disables.
    pub idle_timeout: Option<std::time::Duration>,
    /// Disconnect when the client certificate expires.
    pub disconnect_expired_cert: bool,
}

/// Checks access for one authenticated identity.
pub trait AccessChecker: Send + Sync {
    /// Check access to an application.
    fn check_access(
        &self,
        app: &AppV3,
        mfa: &MfaParams,
        matchers: &[Box<dyn RoleMatcher>],
    ) -> Result<()>;

    /// The connection limits this identity's roles impose.
    fn session_limits(&self) -> SessionLimits {
        SessionLimits::default()
    }
}

/// Produces an [`AccessChecker`] for an identity. The control plane supplies
/// the production implementation; [`StaticAuthorizer`] covers local runs and
/// tests.
pub trait Authorizer: Send + Sync {
    /// Authorize an identity, yielding its access checker.
    fn authorize(&self, identity: &Identity) -> Result<Box<dyn AccessChecker>>;
}

/// An access checker over a concrete set of roles.
pub struct RoleSet {
    roles: Vec<RoleV6>,
}

impl RoleSet {
    /// Build a role set.
    pub fn new(roles: Vec<RoleV6>) -> Self {
        Self { roles }
    }
}

impl AccessChecker for RoleSet {
    fn check_access(
        &self,
        app: &AppV3,
        mfa: &MfaParams,
        matchers: &[Box<dyn RoleMatcher>],
    ) -> Result<()> {
        if !mfa.verified
            && self
                .roles
                .iter()
                .any(|role| role.spec.options.require_session_mfa)
        {
            return Err(Error::access_denied("access requires MFA verification"));
        }

        let labels = app.all_labels();

        // Deny wins over any allow.
        for role in &self.roles {
            let labels_deny = match_labels(&role.spec.deny.app_labels, &labels);
            let matcher_deny = matchers
                .iter()
                .any(|m| m.matches(role, ConditionSide::Deny));
            if labels_deny || matcher_deny {
                return Err(Error::access_denied(format!(
                    "role {:?} denies access to app {:?}",
                    role.metadata.name, app.metadata.name
                )));
            }
        }

        for role in &self.roles {
            if !match_labels(&role.spec.allow.app_labels, &labels) {
                continue;
            }
            if matchers
                .iter()
                .all(|m| m.matches(role, ConditionSide::Allow))
            {
                return Ok(());
            }
        }

        Err(Error::access_denied(format!(
            "no role grants access to app {:?}",
            app.metadata.name
        )))
    }

    fn session_limits(&self) -> SessionLimits {
        let idle_timeout = self
            .roles
            .iter()
            .map(|role| role.spec.options.client_idle_timeout)
            .filter(|timeout| !timeout.is_zero())
            .min();
        let disconnect_expired_cert = self
            .roles
            .iter()
            .any(|role| role.spec.options.disconnect_expired_cert);
        SessionLimits {
            idle_timeout,
            disconnect_expired_cert,
        }
    }
}

/// An authorizer over a fixed role catalog: each identity's `groups` are
/// resolved to the catalog roles of the same name.
pub struct StaticAuthorizer {
    catalog: BTreeMap<String, RoleV6>,
}

impl StaticAuthorizer {
    /// Build an authorizer over the given roles.
    pub fn new(roles: Vec<RoleV6>) -> Arc<Self> {
        Arc::new(Self {
            catalog: roles
                .into_iter()
                .map(|role| (role.metadata.name.clone(), role))
                .collect(),
        })
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, identity: &Identity) -> Result<Box<dyn AccessChecker>> {
        let mut roles = Vec::new();
        for group in &identity.groups {
            match self.catalog.get(group) {
                Some(role) => roles.push(role.clone()),
                None => {
                    return Err(Error::access_denied(format!(
                        "identity references unknown role {group:?}"
                    )))
                }
            }
        }
        if roles.is_empty() {
            return Err(Error::access_denied("identity carries no roles"));
        }
        Ok(Box::new(RoleSet::new(roles)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgate_common::app::AppSpecV3;
    use appgate_common::resource::Metadata;
    use appgate_common::role::RoleSpec;

    fn app_with_labels(labels: &[(&str, &str)]) -> AppV3 {
        let mut metadata = Metadata {
            name: "web".to_string(),
            ..Default::default()
        };
        for (k, v) in labels {
            metadata.labels.insert(k.to_string(), v.to_string());
        }
        AppV3::new(
            metadata,
            AppSpecV3 {
                uri: "http://backend:8080".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn role_with_app_labels(name: &str, labels: Labels) -> RoleV6 {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = labels;
        RoleV6::new(
            "v5",
            Metadata {
                name: name.to_string(),
                ..Default::default()
            },
            spec,
        )
        .unwrap()
    }

    #[test]
    fn wildcard_selector_matches_everything() {
        let selector = Labels::from([("*", &["*"][..])]);
        let mut labels = BTreeMap::new();
        labels.insert("anything".to_string(), "at all".to_string());
        assert!(match_labels(&selector, &labels));
        assert!(match_labels(&selector, &BTreeMap::new()));
    }

    #[test]
    fn empty_selector_matches_nothing() {
        assert!(!match_labels(&Labels::new(), &BTreeMap::new()));
    }

    #[test]
    fn selector_entries_all_must_match() {
        let selector = Labels::from([("env", &["prod", "staging"][..]), ("team", &["core"][..])]);
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        assert!(!match_labels(&selector, &labels));

        labels.insert("team".to_string(), "core".to_string());
        assert!(match_labels(&selector, &labels));

        labels.insert("env".to_string(), "dev".to_string());
        assert!(!match_labels(&selector, &labels));
    }

    #[test]
    fn allow_and_deny() {
        let allow = role_with_app_labels("dev", Labels::from([("env", &["dev"][..])]));
        let checker = RoleSet::new(vec![allow]);

        let dev_app = app_with_labels(&[("env", "dev")]);
        let prod_app = app_with_labels(&[("env", "prod")]);
        let mfa = MfaParams::default();

        assert!(checker.check_access(&dev_app, &mfa, &[]).is_ok());
        assert!(checker
            .check_access(&prod_app, &mfa, &[])
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn deny_wins_over_allow() {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["*"][..])]);
        spec.deny.app_labels = Labels::from([("env", &["prod"][..])]);
        let role = RoleV6::new(
            "v5",
            Metadata {
                name: "dev".to_string(),
                ..Default::default()
            },
            spec,
        )
        .unwrap();
        let checker = RoleSet::new(vec![role]);

        let prod_app = app_with_labels(&[("env", "prod")]);
        assert!(checker
            .check_access(&prod_app, &MfaParams::default(), &[])
            .is_err());
    }

    #[test]
    fn aws_arn_matcher_gates_console_access() {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["*"][..])]);
        spec.allow.aws_role_arns = vec!["arn:aws:iam::123456789012:role/dev".to_string()];
        let role = RoleV6::new(
            "v5",
            Metadata {
                name: "dev".to_string(),
                ..Default::default()
            },
            spec,
        )
        .unwrap();
        let checker = RoleSet::new(vec![role]);
        let app = app_with_labels(&[]);
        let mfa = MfaParams::default();

        let granted: Vec<Box<dyn RoleMatcher>> = vec![Box::new(AwsRoleArnMatcher(
            "arn:aws:iam::123456789012:role/dev".to_string(),
        ))];
        assert!(checker.check_access(&app, &mfa, &granted).is_ok());

        let denied: Vec<Box<dyn RoleMatcher>> = vec![Box::new(AwsRoleArnMatcher(
            "arn:aws:iam::123456789012:role/admin".to_string(),
        ))];
        assert!(checker.check_access(&app, &mfa, &denied).is_err());
    }

    #[test]
    fn mfa_requirement() {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["*"][..])]);
        spec.options.require_session_mfa = true;
        let role = RoleV6::new(
            "v5",
            Metadata {
                name: "secure".to_string(),
                ..Default::default()
            },
            spec,
        )
        .unwrap();
        let checker = RoleSet::new(vec![role]);
        let app = app_with_labels(&[]);

        assert!(checker
            .check_access(&app, &MfaParams { verified: false }, &[])
            .is_err());
        assert!(checker
            .check_access(&app, &MfaParams { verified: true }, &[])
            .is_ok());
    }

    #[test]
    fn session_limits_take_the_strictest_values() {
        let mut strict = RoleSpec::default();
        strict.allow.app_labels = Labels::from([("*", &["*"][..])]);
        strict.options.client_idle_timeout = std::time::Duration::from_secs(300);
        strict.options.disconnect_expired_cert = true;
        let strict = RoleV6::new(
            "v5",
            Metadata {
                name: "strict".to_string(),
                ..Default::default()
            },
            strict,
        )
        .unwrap();

        let lax = role_with_app_labels("lax", Labels::from([("*", &["*"][..])]));

        let limits = RoleSet::new(vec![lax.clone(), strict]).session_limits();
        assert_eq!(limits.idle_timeout, Some(std::time::Duration::from_secs(300)));
        assert!(limits.disconnect_expired_cert);

        let limits = RoleSet::new(vec![lax]).session_limits();
        assert!(limits.idle_timeout.is_none());
        assert!(!limits.disconnect_expired_cert);
    }

    #[test]
    fn static_authorizer_resolves_groups() {
        let authorizer = StaticAuthorizer::new(vec![role_with_app_labels(
            "dev",
            Labels::from([("*", &["*"][..])]),
        )]);

        let mut identity = Identity {
            username: "alice".to_string(),
            groups: vec!["dev".to_string()],
            ..Default::default()
        };
        assert!(authorizer.authorize(&identity).is_ok());

        identity.groups = vec!["missing".to_string()];
        assert!(authorizer.authorize(&identity).is_err());
    }
}
