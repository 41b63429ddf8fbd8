//! Raw TCP application forwarding: dial, splice bytes, account the session.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use appgate_common::app::AppV3;
use appgate_common::errors::{Error, Result};

use crate::audit::{AuditEmitter, AuditEvent, SessionMetadata};

/// Upstream dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy a TCP application connection until either side closes.
///
/// `app.session.start` is emitted before the splice, `app.session.end`
/// unconditionally when it returns.
pub async fn handle_connection<IO>(
    mut io: IO,
    app: &AppV3,
    audit: &dyn AuditEmitter,
    session: &SessionMetadata,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if !app.is_tcp() {
        return Err(Error::bad_parameter(format!(
            "app {:?} is not a TCP application",
            app.metadata.name
        )));
    }
    let uri = url::Url::parse(&app.spec.uri)
        .map_err(|e| Error::bad_parameter(format!("malformed app uri: {e}")))?;
    let host = uri
        .host_str()
        .ok_or_else(|| Error::bad_parameter("app uri is missing a host"))?;
    let port = uri
        .port()
        .ok_or_else(|| Error::bad_parameter("app uri is missing a port"))?;

    let mut upstream =
        tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::connection_problem(format!("dialing {host}:{port} timed out")))?
            .map_err(|e| Error::connection_problem(format!("dialing {host}:{port}: {e}")))?;

    audit.emit(AuditEvent::SessionStart {
        session: session.clone(),
    });

    let result = tokio::io::copy_bidirectional(&mut io, &mut upstream).await;

    audit.emit(AuditEvent::SessionEnd {
        session: session.clone(),
    });

    match result {
        Ok(_) => Ok(()),
        // Either side hanging up mid-splice is a normal end of session.
        Err(error) => {
            tracing::debug!(%error, app = %app.metadata.name, "tcp splice ended with error");
            Ok(())
        }
    }
}
