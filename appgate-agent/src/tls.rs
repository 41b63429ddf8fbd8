//! TLS termination of incoming application connections.
//!
//! Client certificates are required. The CA pool verifying them is resolved
//! per handshake from the SNI-encoded cluster name, so connections tunneled
//! from leaf clusters verify against that cluster's user CA.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::server::{Acceptor, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;

use appgate_common::errors::{Error, Result};
use appgate_common::keys::TlsKeyPair;

use crate::identity::Identity;

/// How long a handshake may take before the connection is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the client-certificate roots of a cluster.
pub trait CaGetter: Send + Sync {
    /// DER roots trusted for client certificates of `cluster_name`; the
    /// empty string means the local cluster.
    fn client_roots(&self, cluster_name: &str) -> Result<Vec<CertificateDer<'static>>>;
}

#[derive(Debug)]
struct StaticCertResolver {
    certified: Arc<rustls::sign::CertifiedKey>,
}

impl rustls::server::ResolvesServerCert for StaticCertResolver {
    fn resolve(
        &self,
        _hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.certified.clone())
    }
}

/// Terminates TLS with required, per-cluster-verified client certificates.
pub struct TlsTerminator {
    certified: Arc<rustls::sign::CertifiedKey>,
    ca_getter: Arc<dyn CaGetter>,
    cipher_suites: Vec<String>,
}

impl TlsTerminator {
    /// Build a terminator serving `keypair`.
    pub fn new(
        keypair: &TlsKeyPair,
        ca_getter: Arc<dyn CaGetter>,
        cipher_suites: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            certified: Arc::new(keypair.certified_key()?),
            ca_getter,
            cipher_suites,
        })
    }

    fn provider(&self) -> rustls::crypto::CryptoProvider {
        let mut provider = rustls::crypto::ring::default_provider();
        if !self.cipher_suites.is_empty() {
            provider
                .cipher_suites
                .retain(|suite| self.cipher_suites.contains(&format!("{:?}", suite.suite())));
        }
        provider
    }

    fn server_config(&self, cluster_name: &str) -> Result<Arc<ServerConfig>> {
        let roots = self.ca_getter.client_roots(cluster_name)?;
        if roots.is_empty() {
            return Err(Error::access_denied(format!(
                "no client certificate authorities for cluster {cluster_name:?}"
            )));
        }
        let mut root_store = RootCertStore::empty();
        for root in roots {
            root_store
                .add(root)
                .map_err(|e| Error::bad_parameter(format!("unusable CA certificate: {e}")))?;
        }

        let provider = Arc::new(self.provider());
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
                .build()
                .map_err(|e| {
                    Error::Internal(anyhow::anyhow!("building client verifier: {e}"))
                })?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Internal(anyhow::anyhow!("building server config: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(Arc::new(StaticCertResolver {
                certified: self.certified.clone(),
            }));
        Ok(Arc::new(config))
    }

    /// Run the handshake and extract the peer identity from the leaf
    /// certificate.
    pub async fn terminate<IO>(
        &self,
        io: IO,
    ) -> Result<(tokio_rustls::server::TlsStream<IO>, Identity)>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), io)
                .await
                .map_err(|e| Error::connection_problem(format!("TLS accept: {e}")))?;

            let cluster_name = start
                .client_hello()
                .server_name()
                .unwrap_or_default()
                .to_string();
            let config = self.server_config(&cluster_name)?;

            start
                .into_stream(config)
                .await
                .map_err(|e| Error::connection_problem(format!("TLS handshake: {e}")))
        };
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| Error::connection_problem("TLS handshake timed out"))??;

        let leaf = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| Error::access_denied("client presented no certificate"))?
            .clone();
        let identity = Identity::from_certificate_der(&leaf)?;
        Ok((stream, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RouteToApp, IDENTITY_EXTENSION_OID, USAGE_APPS};
    use appgate_common::keys::PrivateKey;
    use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};

    struct StaticCa {
        cluster: String,
        roots: Vec<CertificateDer<'static>>,
    }

    impl CaGetter for StaticCa {
        fn client_roots(&self, cluster_name: &str) -> Result<Vec<CertificateDer<'static>>> {
            if cluster_name == self.cluster {
                Ok(self.roots.clone())
            } else {
                Ok(vec![])
            }
        }
    }

    fn test_identity() -> Identity {
        Identity {
            username: "alice".to_string(),
            groups: vec!["dev".to_string()],
            traits: Default::default(),
            route_to_app: RouteToApp {
                session_id: "s1".to_string(),
                public_addr: "web.example.com".to_string(),
                cluster_name: "example.com".to_string(),
                aws_role_arn: None,
            },
            mfa_verified: false,
            client_ip: "10.0.0.9".to_string(),
            usage: vec![USAGE_APPS.to_string()],
            expires: None,
        }
    }

    struct Fixture {
        terminator: TlsTerminator,
        client_config: Arc<rustls::ClientConfig>,
    }

    fn fixture(identity: &Identity) -> Fixture {
        // Server keypair, self-signed, trusted directly by the client.
        let server_key = PrivateKey::generate_p256();
        let rc_server_key = rcgen::KeyPair::from_pem(&server_key.pkcs8_pem().unwrap()).unwrap();
        let server_cert = rcgen::CertificateParams::new(vec!["example.com".to_string()])
            .unwrap()
            .self_signed(&rc_server_key)
            .unwrap();
        let keypair = server_key.tls_certificate(&server_cert.pem()).unwrap();

        // User CA and an identity-bearing client certificate.
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
        client_params.custom_extensions.push(
            rcgen::CustomExtension::from_oid_content(
                IDENTITY_EXTENSION_OID,
                identity.to_extension_payload(),
            ),
        );
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        let terminator = TlsTerminator::new(
            &keypair,
            Arc::new(StaticCa {
                cluster: "example.com".to_string(),
                roots: vec![ca_cert.der().clone()],
            }),
            vec![],
        )
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
            terminator,
            client_config: Arc::new(client_config),
        }
    }

    #[tokio::test]
    async fn terminates_and_extracts_identity() {
        let identity = test_identity();
        let fx = fixture(&identity);

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let connector = tokio_rustls::TlsConnector::from(fx.client_config.clone());
        let client = tokio::spawn(async move {
            let server_name = ServerName::try_from("example.com").unwrap();
            let mut stream = connector.connect(server_name, client_io).await.unwrap();
            use tokio::io::AsyncWriteExt;
            stream.write_all(b"ping").await.unwrap();
            stream
        });

        let (mut stream, extracted) = fx.terminator.terminate(server_io).await.unwrap();
        assert_eq!(extracted.username, identity.username);
        assert_eq!(extracted.route_to_app, identity.route_to_app);
        assert!(extracted.expires.is_some());

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_cluster_has_no_cas() {
        let identity = test_identity();
        let fx = fixture(&identity);

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let connector = tokio_rustls::TlsConnector::from(fx.client_config.clone());
        let client = tokio::spawn(async move {
            let server_name = ServerName::try_from("other-cluster.test").unwrap();
            let _ = connector.connect(server_name, client_io).await;
        });

        let err = fx.terminator.terminate(server_io).await.unwrap_err();
        assert!(err.is_access_denied() || err.is_connection_problem());
        client.await.unwrap();
    }
}
