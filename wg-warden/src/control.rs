// Operator control socket

//! Control socket
//!
//! Line-delimited JSON over a Unix socket. Each request line is answered by
//! exactly one response line:
//!
//! ```text
//! {"op":"enable","peer":"alice","expiry":{"until":"2026-11-01T00:00:00Z"},"quota":{"bytes":10737418240}}
//! {"result":"status","name":"alice","state":"active",...}
//! ```

use crate::daemon::Daemon;
use crate::engine::{PeerStatus, Warden};
use crate::error::Result;
use crate::types::{Lifetime, Quota};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Back-off after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Operator calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    List,
    Status {
        peer: String,
    },
    Enable {
        peer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expiry: Option<Lifetime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quota: Option<Quota>,
    },
    Disable {
        peer: String,
    },
    SetQuota {
        peer: String,
        quota: Quota,
    },
    SetExpiry {
        peer: String,
        expiry: Lifetime,
    },
    Delete {
        peer: String,
    },
}

/// Answers to [`Request`]s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Status(PeerStatus),
    Peers { peers: Vec<PeerStatus> },
    Deleted { peer: String },
    Error { message: String },
}

/// Bind the control socket, replacing a stale one, owner-only permissions
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed stale control socket {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    log::info!("Control socket listening on {:?}", path);
    Ok(listener)
}

/// Accept connections forever, one task per connection
pub async fn serve<D: Daemon>(listener: UnixListener, warden: Warden<D>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let warden = warden.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, warden).await {
                        log::warn!("Control connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                log::error!("Failed to accept control connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn handle_connection<D: Daemon>(stream: UnixStream, warden: Warden<D>) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                log::debug!("Control request: {:?}", request);
                dispatch(&warden, request).await
            }
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let mut out = serde_json::to_string(&response).map_err(io::Error::other)?;
        out.push('\n');
        write.write_all(out.as_bytes()).await?;
    }

    Ok(())
}

/// Run one request against the engine
pub async fn dispatch<D: Daemon>(warden: &Warden<D>, request: Request) -> Response {
    let result = match request {
        Request::List => warden.list_peers().map(|peers| Response::Peers { peers }),
        Request::Status { peer } => warden.status(&peer).await.map(Response::Status),
        Request::Enable {
            peer,
            expiry,
            quota,
        } => warden.enable(&peer, expiry, quota).await.map(Response::Status),
        Request::Disable { peer } => warden.disable(&peer).await.map(Response::Status),
        Request::SetQuota { peer, quota } => {
            warden.set_quota(&peer, quota).await.map(Response::Status)
        }
        Request::SetExpiry { peer, expiry } => {
            warden.set_expiry(&peer, expiry).await.map(Response::Status)
        }
        Request::Delete { peer } => warden
            .delete(&peer)
            .await
            .map(|()| Response::Deleted { peer }),
    };

    result.unwrap_or_else(|e| {
        log::warn!("Control request failed: {}", e);
        Response::Error {
            message: e.to_string(),
        }
    })
}

/// Send one request to a running warden and wait for its response
pub async fn request(socket: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket).await?;
    let (read, mut write) = stream.into_split();

    let mut line = serde_json::to_string(request).map_err(io::Error::other)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;

    let reply = BufReader::new(read)
        .lines()
        .next_line()
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "warden closed the connection"))?;

    Ok(serde_json::from_str(&reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)
}
