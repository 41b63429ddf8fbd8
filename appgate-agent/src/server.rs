//! The application proxy agent core.
//!
//! Owns the registered-application set and everything attached to it:
//! dynamic-label pollers, heartbeat announcers, the reconciler converging
//! against discovered resources, the session cache, and the per-connection
//! ingress path (TLS termination, authorization, dispatch to the HTTP or
//! TCP forwarder).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use appgate_common::app::AppV3;
use appgate_common::errors::{Error, Result};
use appgate_common::jwt;
use appgate_common::keys::TlsKeyPair;
use appgate_common::resource::{Kind, Metadata, DEFAULT_NAMESPACE};
use appgate_common::role::DEFAULT_MAX_SESSION_TTL;
use appgate_common::server::{AppServerSpecV3, AppServerV3, Rotation};
use appgate_presence::{PresenceService, ResourceEvent, ResourceWatcher, WatcherEvent};

use crate::audit::{AuditEmitter, AuditEvent, SessionMetadata};
use crate::authz::{Authorizer, AwsRoleArnMatcher, MfaParams, RoleMatcher, SessionLimits};
use crate::config::AgentConfig;
use crate::connection::{ActivityTracker, ConnectionMonitor, MonitorConfig, TrackedStream};
use crate::dynamic_labels::DynamicLabels;
use crate::forward::http::{error_response, Forwarder, ForwarderConfig, ResponseBody};
use crate::forward::tcp;
use crate::heartbeat::Heartbeat;
use crate::identity::Identity;
use crate::locks::{lock_targets, LockWatcher};
use crate::reconciler::{diff_apps, matches_resource, MonitoredApps, ReconcileNotifier};
use crate::report::{UsageEvent, UsageReporter};
use crate::session::SessionCache;
use crate::tls::{CaGetter, TlsTerminator};

/// Everything the agent needs to run; the control-plane-facing pieces are
/// trait objects supplied by the caller.
pub struct AppAgentSetup {
    /// Agent configuration.
    pub config: AgentConfig,
    /// The presence store client.
    pub presence: Arc<PresenceService>,
    /// Authorization of incoming identities.
    pub authorizer: Arc<dyn Authorizer>,
    /// Audit sink.
    pub audit: Arc<dyn AuditEmitter>,
    /// Per-cluster client-certificate roots.
    pub ca_getter: Arc<dyn CaGetter>,
    /// Lock state of users, roles and sessions.
    pub lock_watcher: Arc<dyn LockWatcher>,
    /// The agent's serving keypair.
    pub tls_keypair: TlsKeyPair,
    /// JWT signing key of the cluster.
    pub jwt_key: Arc<jwt::Key>,
    /// Public proxy port, used when synthesizing redirects.
    pub public_port: u16,
    /// Usage event pipeline; `None` disables reporting.
    pub usage: Option<Arc<UsageReporter<UsageEvent>>>,
}

/// The running agent.
pub struct AppAgent {
    config: AgentConfig,
    presence: Arc<PresenceService>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditEmitter>,
    jwt_key: Arc<jwt::Key>,
    public_port: u16,
    usage: Option<Arc<UsageReporter<UsageEvent>>>,
    lock_watcher: Arc<dyn LockWatcher>,
    terminator: TlsTerminator,

    apps: RwLock<HashMap<String, AppV3>>,
    heartbeats: Mutex<HashMap<String, Heartbeat>>,
    labels: Mutex<HashMap<String, Arc<DynamicLabels>>>,
    sessions: SessionCache<Forwarder>,
    monitored: Mutex<MonitoredApps>,
    notifier: ReconcileNotifier,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppAgent {
    /// Validate the setup, register every static application, and start the
    /// reconciler and resource watcher.
    pub async fn start(setup: AppAgentSetup) -> Result<Arc<Self>> {
        setup.config.check()?;
        let terminator = TlsTerminator::new(
            &setup.tls_keypair,
            setup.ca_getter.clone(),
            setup.config.cipher_suites.clone(),
        )?;
        let (notifier, mut reconcile_rx) = ReconcileNotifier::new();

        let agent = Arc::new(Self {
            config: setup.config,
            presence: setup.presence,
            authorizer: setup.authorizer,
            audit: setup.audit,
            jwt_key: setup.jwt_key,
            public_port: setup.public_port,
            usage: setup.usage,
            lock_watcher: setup.lock_watcher,
            terminator,
            apps: RwLock::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
            sessions: SessionCache::new(),
            monitored: Mutex::new(MonitoredApps::default()),
            notifier,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let static_apps = agent.config.static_apps()?;
        let mut registered: Vec<String> = Vec::new();
        for app in &static_apps {
            let name = app.metadata.name.clone();
            if let Err(error) = agent.register_app(app.clone()).await {
                // Unwind whatever made it up before failing startup.
                for earlier in registered {
                    if let Err(cleanup) = agent.unregister_app(&earlier).await {
                        tracing::warn!(app = %earlier, %cleanup, "cleanup after failed startup");
                    }
                }
                return Err(error);
            }
            registered.push(name);
        }
        agent.monitored.lock().unwrap().static_apps = static_apps;

        {
            let reconcile_agent = agent.clone();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = reconcile_rx.recv() => {
                            if received.is_none() {
                                return;
                            }
                            reconcile_agent.reconcile().await;
                        }
                        _ = reconcile_agent.cancel.cancelled() => return,
                    }
                }
            });
            agent.tasks.lock().unwrap().push(task);
        }

        if !agent.config.resource_matchers.is_empty() {
            let watcher_agent = agent.clone();
            let task = tokio::spawn(async move {
                watch_resources(watcher_agent).await;
            });
            agent.tasks.lock().unwrap().push(task);
        }

        Ok(agent)
    }

    /// Stop all tasks and drain sessions. Announced records age out of the
    /// store by TTL.
    pub async fn close(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.heartbeats.lock().unwrap().clear();
        self.labels.lock().unwrap().clear();
        self.sessions.close_all_sessions();
    }

    /// The currently registered application names, sorted.
    pub fn registered_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    // === Registration ===

    async fn register_app(&self, mut app: AppV3) -> Result<()> {
        app.check_and_set_defaults()?;
        let name = app.metadata.name.clone();

        let labels = Arc::new(DynamicLabels::start(&app.spec.dynamic_labels).await?);

        let snapshot = {
            let presence_app = app.clone();
            let labels = labels.clone();
            let hostname = self.config.hostname.clone();
            let host_id = self.config.host_id.clone();
            let cloud_labels = self.config.cloud_labels.clone();
            Box::new(move || {
                server_snapshot(&presence_app, &hostname, &host_id, &cloud_labels, &labels)
            })
        };
        let heartbeat = Heartbeat::start(self.presence.clone(), snapshot);

        self.labels.lock().unwrap().insert(name.clone(), labels);
        self.heartbeats.lock().unwrap().insert(name.clone(), heartbeat);
        self.apps.write().unwrap().insert(name, app);
        Ok(())
    }

    async fn unregister_app(&self, name: &str) -> Result<()> {
        // Stopping the announcer before deleting avoids re-announcing a
        // record we just removed.
        self.heartbeats.lock().unwrap().remove(name);
        self.labels.lock().unwrap().remove(name);

        match self
            .presence
            .delete_application_server(DEFAULT_NAMESPACE, &self.config.host_id, name)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.apps.write().unwrap().remove(name);
        Ok(())
    }

    async fn update_app(&self, app: AppV3) -> Result<()> {
        let name = app.metadata.name.clone();
        self.heartbeats.lock().unwrap().remove(&name);
        self.labels.lock().unwrap().remove(&name);

        if let Err(register_err) = self.register_app(app).await {
            if let Err(unregister_err) = self.unregister_app(&name).await {
                return Err(Error::Internal(anyhow::anyhow!(
                    "updating app {name}: {register_err}; cleanup failed: {unregister_err}"
                )));
            }
            return Err(register_err);
        }
        Ok(())
    }

    // === Reconciliation ===

    async fn reconcile(&self) {
        let desired = self.monitored.lock().unwrap().get();
        let current = self.apps.read().unwrap().clone();
        let actions = diff_apps(&current, &desired);
        if actions.is_empty() {
            return;
        }
        tracing::info!(
            register = actions.register.len(),
            unregister = actions.unregister.len(),
            update = actions.update.len(),
            "reconciling applications"
        );
        for name in &actions.unregister {
            if let Err(error) = self.unregister_app(name).await {
                tracing::warn!(app = %name, %error, "failed to unregister application");
            }
        }
        for app in actions.register {
            let name = app.metadata.name.clone();
            if let Err(error) = self.register_app(app).await {
                tracing::warn!(app = %name, %error, "failed to register application");
            }
        }
        for app in actions.update {
            let name = app.metadata.name.clone();
            if let Err(error) = self.update_app(app).await {
                tracing::warn!(app = %name, %error, "failed to update application");
            }
        }
    }

    fn set_discovered(&self, apps: Vec<AppV3>) {
        let matchers = &self.config.resource_matchers;
        let filtered: Vec<AppV3> = apps
            .into_iter()
            .filter(|app| matches_resource(matchers, app))
            .collect();
        self.monitored.lock().unwrap().resources = filtered;
        self.notifier.poke();
    }

    fn apply_resource_events(&self, batch: Vec<ResourceEvent>) {
        let matchers = &self.config.resource_matchers;
        {
            let mut monitored = self.monitored.lock().unwrap();
            for event in batch {
                match event {
                    ResourceEvent::Put(resource) => {
                        let appgate_presence::AnyResource::App(app) = resource else {
                            continue;
                        };
                        let name = app.metadata.name.clone();
                        monitored.resources.retain(|a| a.metadata.name != name);
                        // A label change can also un-match the app.
                        if matches_resource(matchers, &app) {
                            monitored.resources.push(app);
                        }
                    }
                    ResourceEvent::Delete(header) => {
                        if header.kind == Kind::App {
                            monitored.resources.retain(|a| a.metadata.name != header.name);
                        }
                    }
                }
            }
        }
        self.notifier.poke();
    }

    // === Ingress ===

    /// Accept connections until cancelled.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let agent = self.clone();
                            tokio::spawn(async move {
                                if let Err(error) = agent.handle_connection(stream, peer).await {
                                    tracing::debug!(%peer, %error, "connection ended with error");
                                }
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Serve one tunneled client connection.
    pub async fn handle_connection<IO>(
        self: &Arc<Self>,
        io: IO,
        remote_addr: SocketAddr,
    ) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tracker = ActivityTracker::new();
        let tracked = TrackedStream::new(io, tracker.clone());
        let (tls_stream, identity) = self.terminator.terminate(tracked).await?;

        let app = self
            .app_by_public_addr(&identity.route_to_app.public_addr)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no application serves {:?}",
                    identity.route_to_app.public_addr
                ))
            })?;

        let authz = self.authorize(&identity, &app);
        let session = self.session_metadata(&identity, &app, remote_addr);

        if app.is_tcp() {
            // TCP has no way to surface a status; a denial ends the
            // connection.
            let limits = authz?;
            self.report_usage(&identity, &app);
            let disconnect = self.cancel.child_token();
            let _monitor = ConnectionMonitor::start(
                self.monitor_config(&limits, &identity),
                tracker,
                disconnect.clone(),
            );
            return tokio::select! {
                result = tcp::handle_connection(
                    tls_stream,
                    &app,
                    self.audit.as_ref(),
                    &session,
                ) => result,
                _ = disconnect.cancelled() => Ok(()),
            };
        }

        // For HTTP apps the denial is stashed and surfaced as a response by
        // the handler.
        let (limits, authz_err) = match authz {
            Ok(limits) => (limits, None),
            Err(err) => (SessionLimits::default(), Some(Arc::new(err))),
        };

        let disconnect = self.cancel.child_token();
        let _monitor = ConnectionMonitor::start(
            self.monitor_config(&limits, &identity),
            tracker,
            disconnect.clone(),
        );

        self.serve_http(tls_stream, identity, app, authz_err, session, disconnect)
            .await
    }

    /// The disconnect limits of one connection: certificate expiry when the
    /// role set requires it, the role-set idle timeout, and the lock targets
    /// derived from the identity.
    fn monitor_config(&self, limits: &SessionLimits, identity: &Identity) -> MonitorConfig {
        MonitorConfig {
            cert_expiry: if limits.disconnect_expired_cert {
                identity.expires
            } else {
                None
            },
            idle_timeout: limits.idle_timeout,
            lock_watcher: Some(self.lock_watcher.clone()),
            lock_targets: lock_targets(identity),
            ..MonitorConfig::default()
        }
    }

    async fn serve_http<IO>(
        self: &Arc<Self>,
        io: IO,
        identity: Identity,
        app: AppV3,
        authz_err: Option<Arc<Error>>,
        session: SessionMetadata,
        disconnect: CancellationToken,
    ) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let agent = self.clone();
        let service = hyper::service::service_fn(move |req| {
            let agent = agent.clone();
            let identity = identity.clone();
            let app = app.clone();
            let authz_err = authz_err.clone();
            let session = session.clone();
            async move {
                let response = match authz_err {
                    Some(err) => error_response(&err),
                    None => agent.handle_request(req, &identity, &app, &session).await,
                };
                Ok::<_, Infallible>(response)
            }
        });

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::select! {
            result = conn => {
                result.map_err(|e| Error::connection_problem(format!("serving connection: {e}")))
            }
            _ = disconnect.cancelled() => Ok(()),
        }
    }

    async fn handle_request(
        &self,
        req: hyper::Request<hyper::body::Incoming>,
        identity: &Identity,
        app: &AppV3,
        session: &SessionMetadata,
    ) -> hyper::Response<ResponseBody> {
        let session_id = if identity.route_to_app.session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            identity.route_to_app.session_id.clone()
        };

        let entry = match self.sessions.acquire(&session_id, || {
            self.new_forwarder(identity, app, session)
        }) {
            Ok(entry) => entry,
            Err(err) => return error_response(&err),
        };
        let response = entry.value.handle(req).await;
        self.sessions.release(&session_id);
        response
    }

    fn new_forwarder(
        &self,
        identity: &Identity,
        app: &AppV3,
        session: &SessionMetadata,
    ) -> Result<Forwarder> {
        let expires = identity
            .expires
            .unwrap_or_else(|| SystemTime::now() + DEFAULT_MAX_SESSION_TTL);
        let token = self.jwt_key.sign(&jwt::SignParams {
            username: identity.username.clone(),
            roles: identity.groups.clone(),
            traits: identity.traits.clone(),
            expires,
            uri: app.spec.uri.clone(),
        })?;

        self.audit.emit(AuditEvent::SessionStart {
            session: session.clone(),
        });
        self.audit.emit(AuditEvent::SessionChunk {
            session: session.clone(),
            session_chunk_id: uuid::Uuid::new_v4().to_string(),
        });
        self.report_usage(identity, app);

        Forwarder::new(ForwarderConfig {
            app: app.clone(),
            identity: identity.clone(),
            jwt: token,
            public_port: self.public_port,
            insecure_skip_verify_override: self.config.insecure_skip_verify_override,
            audit: self.audit.clone(),
            session: session.clone(),
        })
    }

    fn report_usage(&self, identity: &Identity, app: &AppV3) {
        if let Some(usage) = &self.usage {
            usage.enqueue(UsageEvent {
                event_type: "app.session.start".to_string(),
                user: identity.username.clone(),
                app_name: app.metadata.name.clone(),
            });
        }
    }

    fn authorize(&self, identity: &Identity, app: &AppV3) -> Result<SessionLimits> {
        identity.check()?;
        let checker = self.authorizer.authorize(identity)?;
        let mut matchers: Vec<Box<dyn RoleMatcher>> = Vec::new();
        if app.is_aws_console() {
            if let Some(arn) = &identity.route_to_app.aws_role_arn {
                matchers.push(Box::new(AwsRoleArnMatcher(arn.clone())));
            }
        }
        checker.check_access(
            app,
            &MfaParams {
                verified: identity.mfa_verified,
            },
            &matchers,
        )?;
        Ok(checker.session_limits())
    }

    fn app_by_public_addr(&self, public_addr: &str) -> Option<AppV3> {
        let apps = self.apps.read().unwrap();
        let mut names: Vec<&String> = apps.keys().collect();
        names.sort();
        for name in names {
            let app = &apps[name];
            if app.public_addr() == public_addr {
                return Some(app.clone());
            }
        }
        None
    }

    fn session_metadata(
        &self,
        identity: &Identity,
        app: &AppV3,
        remote_addr: SocketAddr,
    ) -> SessionMetadata {
        SessionMetadata {
            cluster_name: self.config.cluster_name.clone(),
            server_id: self.config.host_id.clone(),
            server_namespace: DEFAULT_NAMESPACE.to_string(),
            session_id: identity.route_to_app.session_id.clone(),
            mfa_verified: identity.mfa_verified,
            user: identity.username.clone(),
            remote_addr: remote_addr.to_string(),
            app_uri: app.spec.uri.clone(),
            app_public_addr: app.public_addr().to_string(),
            app_name: app.metadata.name.clone(),
        }
    }
}

/// A fresh server record for one announce: a deep copy of the application
/// with current dynamic-label results and cloud labels overlaid.
fn server_snapshot(
    app: &AppV3,
    hostname: &str,
    host_id: &str,
    cloud_labels: &std::collections::BTreeMap<String, String>,
    labels: &DynamicLabels,
) -> Result<AppServerV3> {
    let mut app = app.clone();
    app.spec.dynamic_labels = labels.get();
    for (key, value) in cloud_labels {
        app.metadata.labels.insert(key.clone(), value.clone());
    }
    AppServerV3::new(
        Metadata {
            name: app.metadata.name.clone(),
            ..Default::default()
        },
        AppServerSpecV3 {
            host_id: host_id.to_string(),
            hostname: hostname.to_string(),
            rotation: Rotation::default(),
            proxy_ids: vec![],
            version: env!("CARGO_PKG_VERSION").to_string(),
            app,
        },
    )
}

async fn watch_resources(agent: Arc<AppAgent>) {
    loop {
        let mut watcher =
            ResourceWatcher::new(vec![Kind::App], vec![], agent.presence.subscribe());

        // Snapshot after subscribing so nothing slips between.
        match agent.presence.get_apps().await {
            Ok(apps) => agent.set_discovered(apps),
            Err(error) => tracing::warn!(%error, "failed to list applications"),
        }

        loop {
            tokio::select! {
                event = watcher.next() => {
                    match event {
                        Some(WatcherEvent::Init(_)) => {}
                        Some(WatcherEvent::Batch(batch)) => agent.apply_resource_events(batch),
                        // Fell behind: resync from a fresh snapshot.
                        Some(WatcherEvent::Resync) | None => break,
                    }
                }
                _ = agent.cancel.cancelled() => return,
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingEmitter;
    use crate::authz::StaticAuthorizer;
    use crate::identity::{RouteToApp, IDENTITY_EXTENSION_OID, USAGE_APPS};
    use crate::locks::{LockTarget, StaticLockWatcher};
    use appgate_common::app::AppSpecV3;
    use appgate_common::keys::PrivateKey;
    use appgate_common::labels::Labels;
    use appgate_common::role::{RoleSpec, RoleV6};
    use appgate_presence::MemoryBackend;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::RootCertStore;
    use std::time::Duration;

    struct StaticCa {
        roots: Vec<CertificateDer<'static>>,
    }

    impl CaGetter for StaticCa {
        fn client_roots(&self, _cluster_name: &str) -> Result<Vec<CertificateDer<'static>>> {
            Ok(self.roots.clone())
        }
    }

    fn wildcard_role(name: &str) -> RoleV6 {
        let mut spec = RoleSpec::default();
        spec.allow.app_labels = Labels::from([("*", &["*"][..])]);
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

    struct Fixture {
        agent: Arc<AppAgent>,
        presence: Arc<PresenceService>,
        audit: Arc<RecordingEmitter>,
        client_config: Arc<rustls::ClientConfig>,
    }

    async fn fixture(config: AgentConfig, identity: &Identity) -> Fixture {
        let presence = PresenceService::new(Arc::new(MemoryBackend::new()));
        let audit = Arc::new(RecordingEmitter::new());

        // Serving keypair, trusted directly by the test client.
        let server_key = PrivateKey::generate_p256();
        let rc_server_key = rcgen::KeyPair::from_pem(&server_key.pkcs8_pem().unwrap()).unwrap();
        let server_cert = rcgen::CertificateParams::new(vec!["example.com".to_string()])
            .unwrap()
            .self_signed(&rc_server_key)
            .unwrap();
        let tls_keypair = server_key.tls_certificate(&server_cert.pem()).unwrap();

        // User CA + identity-bearing client certificate.
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name = rcgen::DistinguishedName::new();
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "user-ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let client_key = rcgen::KeyPair::generate().unwrap();
        let mut client_params = rcgen::CertificateParams::default();
        client_params.distinguished_name = rcgen::DistinguishedName::new();
        client_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, &identity.username);
        client_params
            .custom_extensions
            .push(rcgen::CustomExtension::from_oid_content(
                IDENTITY_EXTENSION_OID,
                identity.to_extension_payload(),
            ));
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        let jwt_key = Arc::new(
            jwt::Key::new(jwt::Config {
                cluster_name: "example.com".to_string(),
                private_key: Some(PrivateKey::generate_p256()),
                public_key: None,
            })
            .unwrap(),
        );

        let agent = AppAgent::start(AppAgentSetup {
            config,
            presence: presence.clone(),
            authorizer: StaticAuthorizer::new(vec![wildcard_role("dev")]),
            audit: audit.clone(),
            ca_getter: Arc::new(StaticCa {
                roots: vec![ca_cert.der().clone()],
            }),
            lock_watcher: StaticLockWatcher::new(),
            tls_keypair,
            jwt_key,
            public_port: 3080,
            usage: None,
        })
        .await
        .unwrap();

        let mut server_roots = RootCertStore::empty();
        server_roots.add(server_cert.der().clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(server_roots)
            .with_client_auth_cert(
                vec![client_cert.der().clone()],
                PrivatePkcs8KeyDer::from(client_key.serialize_der()).into(),
            )
            .unwrap();

        Fixture {
            agent,
            presence,
            audit,
            client_config: Arc::new(client_config),
        }
    }

    fn agent_config(apps: &str) -> AgentConfig {
        AgentConfig::from_toml_str(&format!(
            r#"
                hostname = "agent-1"
                host_id = "h1"
                cluster_name = "example.com"
                {apps}
            "#
        ))
        .unwrap()
    }

    fn test_identity(public_addr: &str) -> Identity {
        Identity {
            username: "alice".to_string(),
            groups: vec!["dev".to_string()],
            traits: Default::default(),
            route_to_app: RouteToApp {
                session_id: "sess-1".to_string(),
                public_addr: public_addr.to_string(),
                cluster_name: "example.com".to_string(),
                aws_role_arn: None,
            },
            mfa_verified: false,
            client_ip: "10.0.0.9".to_string(),
            usage: vec![USAGE_APPS.to_string()],
            expires: None,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn static_apps_register_and_heartbeat() {
        let config = agent_config(
            r#"
                [[apps]]
                name = "web"
                uri = "http://127.0.0.1:18080"
                public_addr = "web.example.com"
            "#,
        );
        let fx = fixture(config, &test_identity("web.example.com")).await;

        assert_eq!(fx.agent.registered_apps(), vec!["web".to_string()]);

        let mut announced = false;
        for _ in 0..200 {
            if !fx
                .presence
                .get_application_servers("default")
                .await
                .unwrap()
                .is_empty()
            {
                announced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(announced, "heartbeat never announced");

        let servers = fx.presence.get_application_servers("default").await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].spec.host_id, "h1");
        assert_eq!(servers[0].spec.hostname, "agent-1");
        assert_eq!(servers[0].spec.app.metadata.name, "web");

        fx.agent.close().await;
    }

    #[tokio::test]
    async fn reconciler_tracks_discovered_apps() {
        let config = agent_config(
            r#"
                [[resource_matchers]]
                labels = { "*" = ["*"] }
            "#,
        );
        let fx = fixture(config, &test_identity("dyn.example.com")).await;

        let app = AppV3::new(
            Metadata {
                name: "dyn".to_string(),
                ..Default::default()
            },
            AppSpecV3 {
                uri: "http://127.0.0.1:18081".to_string(),
                public_addr: "dyn.example.com".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        fx.presence.create_app(app).await.unwrap();

        let agent = fx.agent.clone();
        wait_until(move || agent.registered_apps() == vec!["dyn".to_string()]).await;

        fx.presence.delete_app("dyn").await.unwrap();
        let agent = fx.agent.clone();
        wait_until(move || agent.registered_apps().is_empty()).await;

        fx.agent.close().await;
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let config = agent_config(
            r#"
                [[apps]]
                name = "web"
                uri = "http://127.0.0.1:18080"
                public_addr = "web.example.com"
            "#,
        );
        let fx = fixture(config, &test_identity("web.example.com")).await;

        fx.agent.reconcile().await;
        let before = fx.agent.registered_apps();
        fx.agent.reconcile().await;
        assert_eq!(fx.agent.registered_apps(), before);

        fx.agent.close().await;
    }

    #[tokio::test]
    async fn end_to_end_http_request_over_tls() {
        // Upstream the agent forwards to.
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = upstream.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(
                        |req: hyper::Request<hyper::body::Incoming>| async move {
                            assert!(req
                                .headers()
                                .contains_key("teleport-jwt-assertion"));
                            Ok::<_, Infallible>(hyper::Response::new(
                                http_body_util::Full::new(bytes::Bytes::from_static(b"hello")),
                            ))
                        },
                    );
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let config = agent_config(&format!(
            r#"
                [[apps]]
                name = "web"
                uri = "http://127.0.0.1:{}"
                public_addr = "web.example.com"
            "#,
            upstream_addr.port()
        ));
        let identity = test_identity("web.example.com");
        let fx = fixture(config, &identity).await;

        // Drive a TLS connection straight into the agent.
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let agent = fx.agent.clone();
        let serve = tokio::spawn(async move {
            agent
                .handle_connection(server_io, "10.0.0.9:50000".parse().unwrap())
                .await
        });

        let connector = tokio_rustls::TlsConnector::from(fx.client_config.clone());
        let server_name = ServerName::try_from("example.com").unwrap();
        let tls = connector.connect(server_name, client_io).await.unwrap();

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = hyper::Request::builder()
            .method("GET")
            .uri("/index.html")
            .header(http::header::HOST, "web.example.com")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"hello");

        // Session and request events made it out.
        let names = fx.audit.names();
        assert!(names.contains(&"app.session.start"));
        assert!(names.contains(&"app.session.request"));

        drop(sender);
        let _ = serve.await;
        fx.agent.close().await;
    }

    #[tokio::test]
    async fn monitor_carries_lock_targets_and_limits() {
        let config = agent_config(
            r#"
                [[apps]]
                name = "web"
                uri = "http://127.0.0.1:18080"
                public_addr = "web.example.com"
            "#,
        );
        let identity = test_identity("web.example.com");
        let fx = fixture(config, &identity).await;

        let limits = crate::authz::SessionLimits {
            idle_timeout: Some(Duration::from_secs(300)),
            disconnect_expired_cert: true,
        };
        let mut identity = identity;
        identity.expires = Some(std::time::SystemTime::now() + Duration::from_secs(60));

        let monitor = fx.agent.monitor_config(&limits, &identity);
        assert_eq!(monitor.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(monitor.cert_expiry, identity.expires);
        assert!(monitor.lock_watcher.is_some());
        assert!(monitor
            .lock_targets
            .contains(&LockTarget::User("alice".to_string())));
        assert!(monitor
            .lock_targets
            .contains(&LockTarget::Role("dev".to_string())));
        assert!(monitor
            .lock_targets
            .contains(&LockTarget::Session("sess-1".to_string())));

        fx.agent.close().await;
    }

    #[tokio::test]
    async fn unknown_public_addr_is_not_found() {
        let config = agent_config(
            r#"
                [[apps]]
                name = "web"
                uri = "http://127.0.0.1:18080"
                public_addr = "web.example.com"
            "#,
        );
        let identity = test_identity("unknown.example.com");
        let fx = fixture(config, &identity).await;

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let agent = fx.agent.clone();
        let serve = tokio::spawn(async move {
            agent
                .handle_connection(server_io, "10.0.0.9:50000".parse().unwrap())
                .await
        });

        let connector = tokio_rustls::TlsConnector::from(fx.client_config.clone());
        let server_name = ServerName::try_from("example.com").unwrap();
        let _ = connector.connect(server_name, client_io).await;

        let result = serve.await.unwrap();
        assert!(result.unwrap_err().is_not_found());
        fx.agent.close().await;
    }
}
