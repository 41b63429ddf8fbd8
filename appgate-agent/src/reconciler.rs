//! Set reconciliation between registered and monitored applications.
//!
//! The agent keeps `monitored = static ∪ discovered` and converges its
//! registered set towards it. Reconciliation runs are serialized through a
//! capacity-one notifier: at most one runs, at most one is queued, and a
//! poke while one is queued is dropped.

use std::collections::HashMap;

use tokio::sync::mpsc;

use appgate_common::app::AppV3;
use appgate_common::labels::Labels;
use appgate_common::resource::ResourceWithLabels;

use crate::config::ResourceMatcher;

/// The union of statically configured and dynamically discovered
/// applications.
#[derive(Debug, Default, Clone)]
pub struct MonitoredApps {
    /// Statically configured applications; never change at runtime.
    pub static_apps: Vec<AppV3>,
    /// Applications discovered through the resource watcher.
    pub resources: Vec<AppV3>,
}

impl MonitoredApps {
    /// The monitored set, static apps winning name collisions.
    pub fn get(&self) -> Vec<AppV3> {
        let mut out = self.static_apps.clone();
        for app in &self.resources {
            if !out.iter().any(|existing| existing.metadata.name == app.metadata.name) {
                out.push(app.clone());
            }
        }
        out
    }
}

/// What a reconciliation pass has to do.
#[derive(Debug, Default, PartialEq)]
pub struct ReconcileActions {
    /// Applications to register.
    pub register: Vec<AppV3>,
    /// Application names to unregister.
    pub unregister: Vec<String>,
    /// Applications whose registration must be refreshed.
    pub update: Vec<AppV3>,
}

impl ReconcileActions {
    /// True when the sets already converged.
    pub fn is_empty(&self) -> bool {
        self.register.is_empty() && self.unregister.is_empty() && self.update.is_empty()
    }
}

/// Two applications are equal for reconciliation when labels and spec agree;
/// backend-assigned ids and expiry churn are ignored.
fn apps_equal(a: &AppV3, b: &AppV3) -> bool {
    a.metadata.labels == b.metadata.labels
        && a.metadata.description == b.metadata.description
        && a.spec == b.spec
}

/// Diff the registered set against the desired set.
pub fn diff_apps(current: &HashMap<String, AppV3>, desired: &[AppV3]) -> ReconcileActions {
    let mut actions = ReconcileActions::default();

    let mut desired_names = std::collections::HashSet::new();
    for app in desired {
        desired_names.insert(app.metadata.name.clone());
        match current.get(&app.metadata.name) {
            None => actions.register.push(app.clone()),
            Some(existing) if !apps_equal(existing, app) => actions.update.push(app.clone()),
            Some(_) => {}
        }
    }
    for name in current.keys() {
        if !desired_names.contains(name) {
            actions.unregister.push(name.clone());
        }
    }
    actions.unregister.sort();
    actions
}

/// True if the application matches any of the configured resource matchers.
pub fn matches_resource(matchers: &[ResourceMatcher], app: &AppV3) -> bool {
    let labels = app.all_labels();
    matchers.iter().any(|matcher| {
        let selector: Labels = matcher.selector();
        crate::authz::match_labels(&selector, &labels)
    })
}

/// The capacity-one reconciliation notifier.
pub struct ReconcileNotifier {
    tx: mpsc::Sender<()>,
}

impl ReconcileNotifier {
    /// A notifier and its receiving end.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a reconciliation; dropped when one is already queued.
    pub fn poke(&self) {
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgate_common::app::AppSpecV3;
    use appgate_common::resource::{Metadata, ResourceWithLabels};

    fn app(name: &str, labels: &[(&str, &str)]) -> AppV3 {
        let mut metadata = Metadata {
            name: name.to_string(),
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

    fn registered(apps: &[AppV3]) -> HashMap<String, AppV3> {
        apps.iter()
            .map(|a| (a.metadata.name.clone(), a.clone()))
            .collect()
    }

    #[test]
    fn diff_registers_updates_and_unregisters() {
        let current = registered(&[app("keep", &[]), app("stale", &[]), app("change", &[])]);
        let desired = vec![
            app("keep", &[]),
            app("change", &[("env", "prod")]),
            app("new", &[]),
        ];

        let actions = diff_apps(&current, &desired);
        assert_eq!(actions.register.len(), 1);
        assert_eq!(actions.register[0].metadata.name, "new");
        assert_eq!(actions.update.len(), 1);
        assert_eq!(actions.update[0].metadata.name, "change");
        assert_eq!(actions.unregister, vec!["stale".to_string()]);
    }

    #[test]
    fn diff_is_idempotent_on_identical_sets() {
        let desired = vec![app("a", &[("env", "dev")]), app("b", &[])];
        let current = registered(&desired);
        assert!(diff_apps(&current, &desired).is_empty());
    }

    #[test]
    fn monitored_set_prefers_static_apps() {
        let monitored = MonitoredApps {
            static_apps: vec![app("web", &[("origin", "static")])],
            resources: vec![app("web", &[("origin", "dynamic")]), app("db", &[])],
        };
        let set = monitored.get();
        assert_eq!(set.len(), 2);
        let web = set.iter().find(|a| a.metadata.name == "web").unwrap();
        assert_eq!(web.all_labels().get("origin").unwrap(), "static");
    }

    #[test]
    fn resource_matchers_select_by_label() {
        let matcher: ResourceMatcher = toml::from_str(r#"labels = { env = ["prod"] }"#).unwrap();
        assert!(matches_resource(&[matcher.clone()], &app("a", &[("env", "prod")])));
        assert!(!matches_resource(&[matcher], &app("b", &[("env", "dev")])));
        assert!(!matches_resource(&[], &app("c", &[])));
    }

    #[test]
    fn notifier_drops_excess_pokes() {
        let (notifier, mut rx) = ReconcileNotifier::new();
        notifier.poke();
        notifier.poke();
        notifier.poke();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
