//! The HTTP forwarder.
//!
//! One forwarder serves one application session: it carries the signed JWT
//! asserting the end user, rewrites requests onto the upstream address,
//! applies the application's header and redirect rewrite rules, and tunnels
//! websocket upgrades. Upstream round-trips go through a client whose TLS
//! verification honors the application's `insecure_skip_verify`.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::body::{Body, Frame};
use hyper_util::rt::TokioIo;
use url::Url;

use appgate_common::app::AppV3;
use appgate_common::errors::{Error, Result};

use crate::audit::{AuditEmitter, AuditEvent, SessionMetadata};
use crate::identity::Identity;

/// The JWT assertion header upstreams authenticate with.
pub const TELEPORT_JWT_HEADER: &str = "Teleport-JWT-Assertion";
/// The same assertion under the header Cloudflare-Access-aware upstreams
/// expect.
pub const CF_JWT_HEADER: &str = "Cf-Access-Jwt-Assertion";

/// Headers the forwarder owns; configured rewrites must not touch them.
pub const RESERVED_HEADERS: &[&str] = &[
    TELEPORT_JWT_HEADER,
    CF_JWT_HEADER,
    "X-Forwarded-Ssl",
    "X-Forwarded-For",
    "X-Forwarded-Host",
    "X-Forwarded-Proto",
    "X-Forwarded-Port",
    "X-Forwarded-Server",
];

const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The boxed response body every forwarder response uses.
pub type ResponseBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::io::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything needed to build a [`Forwarder`].
pub struct ForwarderConfig {
    /// The application being served.
    pub app: AppV3,
    /// The authenticated identity.
    pub identity: Identity,
    /// The signed JWT asserting the identity towards the upstream.
    pub jwt: String,
    /// Public proxy port used when synthesizing redirects.
    pub public_port: u16,
    /// Process-wide override of upstream TLS verification.
    pub insecure_skip_verify_override: Option<bool>,
    /// Audit sink.
    pub audit: Arc<dyn AuditEmitter>,
    /// Audit envelope of this session.
    pub session: SessionMetadata,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("app", &self.app)
            .field("uri", &self.uri)
            .field("public_port", &self.public_port)
            .finish_non_exhaustive()
    }
}

/// Forwards the requests of one application session.
pub struct Forwarder {
    app: AppV3,
    identity: Identity,
    uri: Url,
    jwt: String,
    public_port: u16,
    client: reqwest::Client,
    audit: Arc<dyn AuditEmitter>,
    session: SessionMetadata,
}

impl Forwarder {
    /// Build a forwarder, parsing the application URI once.
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        let uri = Url::parse(&config.app.spec.uri)
            .map_err(|e| Error::bad_parameter(format!("malformed app uri: {e}")))?;
        if !matches!(uri.scheme(), "http" | "https") {
            return Err(Error::bad_parameter(format!(
                "app {:?} is not an HTTP application",
                config.app.metadata.name
            )));
        }
        let insecure = config
            .insecure_skip_verify_override
            .unwrap_or(config.app.spec.insecure_skip_verify);
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(crate::forward::tcp::DEFAULT_DIAL_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("building upstream client: {e}")))?;
        Ok(Self {
            app: config.app,
            identity: config.identity,
            uri,
            jwt: config.jwt,
            public_port: config.public_port,
            client,
            audit: config.audit,
            session: config.session,
        })
    }

    /// Serve one request; errors become the appropriate HTTP response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        match self.forward(req).await {
            Ok(response) => response,
            Err(error) => error_response(&error),
        }
    }

    async fn forward<B>(&self, mut req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        if is_websocket_upgrade(req.headers()) {
            return self.forward_websocket(req).await;
        }

        // An app rooted at a sub-path bounces `/` to that sub-path before
        // any forwarding happens.
        if self.uri.path() != "/" && req.uri().path() == "/" {
            let location = format!(
                "https://{}:{}{}",
                self.app.public_addr(),
                self.public_port,
                self.uri.path()
            );
            return redirect_response(&location);
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let raw_query = req.uri().query().unwrap_or_default().to_string();
        let upstream_url = self.upstream_url(req.uri())?;
        let headers = self.build_headers(req.headers())?;

        let body = reqwest::Body::wrap_stream(into_byte_stream(req.into_body()));
        let upstream_response = self
            .client
            .request(method.clone(), upstream_url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::connection_problem(format!("upstream request: {e}")))?;

        let status = upstream_response.status();
        self.emit_request_event(&method, &path, &raw_query, status);

        let mut builder = Response::builder().status(status);
        for (name, value) in upstream_response.headers() {
            builder = builder.header(name, value);
        }
        let mut response = builder
            .body(stream_response_body(upstream_response))
            .map_err(|e| Error::Internal(anyhow::anyhow!("building response: {e}")))?;
        self.rewrite_redirect(&mut response)?;
        Ok(response)
    }

    async fn forward_websocket<B>(&self, mut req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let raw_query = req.uri().query().unwrap_or_default().to_string();
        let upstream_url = self.upstream_url(req.uri())?;
        let mut headers = self.build_headers(req.headers())?;
        // The upgrade negotiation headers are hop-by-hop but must survive.
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        let upstream_response = self
            .client
            .request(method.clone(), upstream_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::connection_problem(format!("upstream upgrade: {e}")))?;

        let status = upstream_response.status();
        self.emit_request_event(&method, &path, &raw_query, status);

        if status != StatusCode::SWITCHING_PROTOCOLS {
            let mut builder = Response::builder().status(status);
            for (name, value) in upstream_response.headers() {
                builder = builder.header(name, value);
            }
            return builder
                .body(stream_response_body(upstream_response))
                .map_err(|e| Error::Internal(anyhow::anyhow!("building response: {e}")));
        }

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in upstream_response.headers() {
            builder = builder.header(name, value);
        }

        let client_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let client_io = match client_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::debug!(%error, "client websocket upgrade failed");
                    return;
                }
            };
            let mut upstream_io = match upstream_response.upgrade().await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::debug!(%error, "upstream websocket upgrade failed");
                    return;
                }
            };
            let mut client_io = TokioIo::new(client_io);
            if let Err(error) =
                tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
            {
                tracing::debug!(%error, "websocket tunnel ended");
            }
        });

        builder
            .body(empty_body())
            .map_err(|e| Error::Internal(anyhow::anyhow!("building response: {e}")))
    }

    /// The upstream URL for an incoming request: the app URI's scheme and
    /// authority with the request's path and query.
    fn upstream_url(&self, req_uri: &http::Uri) -> Result<Url> {
        let mut url = self.uri.clone();
        url.set_path(req_uri.path());
        url.set_query(req_uri.query());
        Ok(url)
    }

    /// The forwarded header set: original headers minus hop-by-hop, plus the
    /// JWT assertions, the configured rewrites and the `X-Forwarded-*`
    /// family.
    fn build_headers(&self, original: &HeaderMap) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in original {
            if HOP_BY_HOP_HEADERS.contains(name) || *name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let jwt = HeaderValue::from_str(&self.jwt)
            .map_err(|e| Error::Internal(anyhow::anyhow!("unusable jwt header: {e}")))?;
        headers.insert(HeaderName::from_static("teleport-jwt-assertion"), jwt.clone());
        headers.insert(HeaderName::from_static("cf-access-jwt-assertion"), jwt);

        if let Some(rewrite) = &self.app.spec.rewrite {
            for rule in &rewrite.headers {
                if is_reserved_header(&rule.name) {
                    tracing::warn!(header = %rule.name, "skipping rewrite of reserved header");
                    continue;
                }
                let Some(value) = expand_traits(&rule.value, &self.identity.traits) else {
                    continue;
                };
                let Ok(value) = HeaderValue::from_str(&value) else {
                    tracing::warn!(header = %rule.name, "skipping rewrite with unusable value");
                    continue;
                };
                if rule.name.eq_ignore_ascii_case("host") {
                    headers.insert(header::HOST, value);
                    continue;
                }
                let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
                    continue;
                };
                headers.insert(name, value);
            }
        }

        if !self.identity.client_ip.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.identity.client_ip) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(self.app.public_addr()) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), value);
        }
        headers.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("https"),
        );
        headers.insert(
            HeaderName::from_static("x-forwarded-ssl"),
            HeaderValue::from_static("on"),
        );
        Ok(headers)
    }

    /// Rewrite redirects pointing at allow-listed hosts back to the app's
    /// public address.
    fn rewrite_redirect(&self, response: &mut Response<ResponseBody>) -> Result<()> {
        if !response.status().is_redirection() {
            return Ok(());
        }
        let Some(rewrite) = &self.app.spec.rewrite else {
            return Ok(());
        };
        let Some(location) = response.headers().get(header::LOCATION) else {
            return Ok(());
        };
        let Ok(location) = location.to_str() else {
            return Ok(());
        };
        let Ok(target) = Url::parse(location) else {
            return Ok(());
        };
        let Some(host) = target.host_str() else {
            return Ok(());
        };
        if !rewrite.redirect.iter().any(|allowed| allowed == host) {
            return Ok(());
        }

        let mut rewritten = format!(
            "https://{}:{}{}",
            self.app.public_addr(),
            self.public_port,
            target.path()
        );
        if let Some(query) = target.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        let value = HeaderValue::from_str(&rewritten)
            .map_err(|e| Error::Internal(anyhow::anyhow!("unusable location: {e}")))?;
        response.headers_mut().insert(header::LOCATION, value);
        Ok(())
    }

    fn emit_request_event(
        &self,
        method: &http::Method,
        path: &str,
        raw_query: &str,
        status: StatusCode,
    ) {
        self.audit.emit(AuditEvent::SessionRequest {
            session: self.session.clone(),
            method: method.to_string(),
            path: path.to_string(),
            raw_query: raw_query.to_string(),
            status_code: status.as_u16(),
        });
    }
}

/// True if the header belongs to the forwarder.
pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Expand `{{internal.<trait>}}` / `{{external.<trait>}}` against the user's
/// traits; `None` when a referenced trait is absent.
pub fn expand_traits(
    value: &str,
    traits: &std::collections::BTreeMap<String, Vec<String>>,
) -> Option<String> {
    let mut out = String::new();
    let mut rest = value;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let expr = rest[start + 2..start + end].trim();
        let name = expr
            .strip_prefix("internal.")
            .or_else(|| expr.strip_prefix("external."))
            .unwrap_or(expr);
        let first = traits.get(name).and_then(|values| values.first())?;
        out.push_str(first);
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    Some(out)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgraded = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgraded && connection
}

fn into_byte_stream<B>(
    body: B,
) -> impl futures_util::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    BodyStream::new(body).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(error) => {
                let error: BoxError = error.into();
                Some(Err(std::io::Error::other(error.to_string())))
            }
        }
    })
}

fn stream_response_body(response: reqwest::Response) -> ResponseBody {
    let stream = response.bytes_stream().map(|chunk| {
        chunk
            .map(Frame::data)
            .map_err(|e| std::io::Error::other(e.to_string()))
    });
    StreamBody::new(stream).boxed_unsync()
}

fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_body(text: String) -> ResponseBody {
    http_body_util::Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A 302 with the given location.
pub fn redirect_response(location: &str) -> Result<Response<ResponseBody>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(empty_body())
        .map_err(|e| Error::Internal(anyhow::anyhow!("building redirect: {e}")))
}

/// The outward HTTP rendering of an error, per the error taxonomy.
pub fn error_response(error: &Error) -> Response<ResponseBody> {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::debug!(%error, status = status.as_u16(), "request failed");
    Response::builder()
        .status(status)
        .body(text_body(error.to_string()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingEmitter;
    use crate::identity::RouteToApp;
    use appgate_common::app::{AppSpecV3, Header as RewriteHeader, Rewrite};
    use appgate_common::jwt;
    use appgate_common::keys::PrivateKey;
    use appgate_common::resource::Metadata;
    use http_body_util::Full;
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    async fn spawn_upstream() -> (SocketAddr, Arc<Mutex<Vec<HeaderMap>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured: Arc<Mutex<Vec<HeaderMap>>> = Arc::new(Mutex::new(Vec::new()));
        let cap = captured.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let cap = cap.clone();
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(
                        move |req: Request<hyper::body::Incoming>| {
                            let cap = cap.clone();
                            async move {
                                cap.lock().unwrap().push(req.headers().clone());
                                let response = if req.uri().path() == "/app/acme/bounce" {
                                    Response::builder()
                                        .status(StatusCode::FOUND)
                                        .header(
                                            header::LOCATION,
                                            "http://localhost:9999/login?next=1",
                                        )
                                        .body(Full::new(Bytes::new()))
                                        .unwrap()
                                } else {
                                    Response::builder()
                                        .status(StatusCode::OK)
                                        .body(Full::new(Bytes::from_static(b"ok")))
                                        .unwrap()
                                };
                                Ok::<_, Infallible>(response)
                            }
                        },
                    );
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, captured)
    }

    struct Fixture {
        forwarder: Forwarder,
        audit: Arc<RecordingEmitter>,
        key: jwt::Key,
        uri: String,
        captured: Arc<Mutex<Vec<HeaderMap>>>,
    }

    async fn fixture() -> Fixture {
        let (addr, captured) = spawn_upstream().await;
        let uri = format!("http://127.0.0.1:{}/app/acme", addr.port());

        let app = AppV3::new(
            Metadata {
                name: "acme".to_string(),
                ..Default::default()
            },
            AppSpecV3 {
                uri: uri.clone(),
                public_addr: "acme.example.com".to_string(),
                rewrite: Some(Rewrite {
                    redirect: vec!["localhost".to_string()],
                    headers: vec![
                        RewriteHeader {
                            name: "X-Login".to_string(),
                            value: "{{internal.logins}}".to_string(),
                        },
                        RewriteHeader {
                            name: TELEPORT_JWT_HEADER.to_string(),
                            value: "spoofed".to_string(),
                        },
                    ],
                }),
                ..Default::default()
            },
        )
        .unwrap();

        let key = jwt::Key::new(jwt::Config {
            cluster_name: "example.com".to_string(),
            private_key: Some(PrivateKey::generate_p256()),
            public_key: None,
        })
        .unwrap();

        let mut traits = BTreeMap::new();
        traits.insert("logins".to_string(), vec!["root".to_string()]);
        let identity = Identity {
            username: "alice".to_string(),
            groups: vec!["dev".to_string()],
            traits: traits.clone(),
            route_to_app: RouteToApp {
                session_id: "s1".to_string(),
                public_addr: "acme.example.com".to_string(),
                cluster_name: "example.com".to_string(),
                aws_role_arn: None,
            },
            mfa_verified: false,
            client_ip: "10.1.2.3".to_string(),
            usage: vec![],
            expires: None,
        };

        let token = key
            .sign(&jwt::SignParams {
                username: identity.username.clone(),
                roles: identity.groups.clone(),
                traits,
                expires: SystemTime::now() + Duration::from_secs(300),
                uri: uri.clone(),
            })
            .unwrap();

        let audit = Arc::new(RecordingEmitter::new());
        let forwarder = Forwarder::new(ForwarderConfig {
            app,
            identity,
            jwt: token,
            public_port: 3080,
            insecure_skip_verify_override: None,
            audit: audit.clone(),
            session: SessionMetadata::default(),
        })
        .unwrap();

        Fixture {
            forwarder,
            audit,
            key,
            uri,
            captured,
        }
    }

    fn request(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(header::HOST, "acme.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_path_redirects_to_app_path() {
        let fx = fixture().await;
        let response = fx.forwarder.handle(request("/")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://acme.example.com:3080/app/acme"
        );
        // Nothing reached the upstream.
        assert!(fx.captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forwards_with_jwt_and_forwarding_headers() {
        let fx = fixture().await;
        let response = fx.forwarder.handle(request("/app/acme/foo")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let captured = fx.captured.lock().unwrap();
        let headers = captured.first().expect("upstream saw the request");

        let assertion = headers
            .get(TELEPORT_JWT_HEADER)
            .expect("jwt assertion present")
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(
            headers.get(CF_JWT_HEADER).unwrap().to_str().unwrap(),
            assertion
        );
        // The reserved-header rewrite was ignored.
        assert_ne!(assertion, "spoofed");

        let claims = fx
            .key
            .verify(&jwt::VerifyParams {
                username: "alice".to_string(),
                raw_token: assertion,
                uri: fx.uri.clone(),
            })
            .unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.aud, vec![fx.uri.clone()]);
        assert_eq!(claims.iss, "example.com");

        assert_eq!(headers.get("x-forwarded-ssl").unwrap(), "on");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "acme.example.com");
        // Trait expansion.
        assert_eq!(headers.get("x-login").unwrap(), "root");
    }

    #[tokio::test]
    async fn emits_one_request_event_per_response() {
        let fx = fixture().await;
        fx.forwarder.handle(request("/app/acme/foo")).await;
        fx.forwarder.handle(request("/app/acme/bar")).await;

        let events = fx.audit.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            AuditEvent::SessionRequest {
                method,
                path,
                status_code,
                ..
            } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/app/acme/foo");
                assert_eq!(*status_code, 200);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn allow_listed_redirects_are_rewritten() {
        let fx = fixture().await;
        let response = fx.forwarder.handle(request("/app/acme/bounce")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://acme.example.com:3080/login?next=1"
        );
    }

    #[tokio::test]
    async fn upstream_dial_failure_is_a_502() {
        let fx = fixture().await;
        // Rebuild the forwarder against a dead upstream.
        let mut app = fx.forwarder.app.clone();
        app.spec.uri = "http://127.0.0.1:1/app/acme".to_string();
        let forwarder = Forwarder::new(ForwarderConfig {
            app,
            identity: fx.forwarder.identity.clone(),
            jwt: fx.forwarder.jwt.clone(),
            public_port: 3080,
            insecure_skip_verify_override: None,
            audit: fx.audit.clone(),
            session: SessionMetadata::default(),
        })
        .unwrap();

        let response = forwarder.handle(request("/app/acme/foo")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn trait_expansion() {
        let mut traits = BTreeMap::new();
        traits.insert("logins".to_string(), vec!["root".to_string(), "admin".to_string()]);

        assert_eq!(
            expand_traits("{{internal.logins}}", &traits).unwrap(),
            "root"
        );
        assert_eq!(
            expand_traits("user={{external.logins}};", &traits).unwrap(),
            "user=root;"
        );
        assert_eq!(expand_traits("static", &traits).unwrap(), "static");
        assert!(expand_traits("{{internal.missing}}", &traits).is_none());
    }

    #[test]
    fn reserved_headers_are_case_insensitive() {
        assert!(is_reserved_header("teleport-jwt-assertion"));
        assert!(is_reserved_header("X-FORWARDED-SSL"));
        assert!(!is_reserved_header("X-Custom"));
    }

    #[test]
    fn tcp_apps_are_rejected() {
        let app = AppV3::new(
            Metadata {
                name: "db".to_string(),
                ..Default::default()
            },
            AppSpecV3 {
                uri: "tcp://db:5432".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let err = Forwarder::new(ForwarderConfig {
            app,
            identity: Identity::default(),
            jwt: String::new(),
            public_port: 3080,
            insecure_skip_verify_override: None,
            audit: Arc::new(RecordingEmitter::new()),
            session: SessionMetadata::default(),
        })
        .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
