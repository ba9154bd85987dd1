//! Opaque WebSocket <-> TCP relay for VNC and SPICE consoles.
//!
//! The proxy never interprets the console bytes. Inbound frames of either
//! the `binary` or `text` kind are concatenated into the TCP stream (some
//! clients send handshake bytes as text); outbound data is always framed
//! as `binary`. When either copy direction ends, both ends are torn down
//! to unblock the other.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use virtumancer_driver::{GraphicsKind, HypervisorUri};

use crate::error::{ControlError, Result};
use crate::service::ControlPlaneService;

/// Copy buffer size per direction.
const COPY_BUFFER: usize = 1024;

pub async fn vnc_handler(
    ws: WebSocketUpgrade,
    Path((host_id, vm_name)): Path<(String, String)>,
    State(service): State<Arc<ControlPlaneService>>,
) -> impl IntoResponse {
    ws.protocols(["binary"])
        .on_upgrade(move |socket| handle_console(socket, service, host_id, vm_name, GraphicsKind::Vnc))
}

pub async fn spice_handler(
    ws: WebSocketUpgrade,
    Path((host_id, vm_name)): Path<(String, String)>,
    State(service): State<Arc<ControlPlaneService>>,
) -> impl IntoResponse {
    ws.protocols(["binary"])
        .on_upgrade(move |socket| handle_console(socket, service, host_id, vm_name, GraphicsKind::Spice))
}

async fn handle_console(
    socket: WebSocket,
    service: Arc<ControlPlaneService>,
    host_id: String,
    vm_name: String,
    kind: GraphicsKind,
) {
    let (host, port) = match resolve_target(&service, &host_id, &vm_name, kind).await {
        Ok(target) => target,
        Err(e) => {
            warn!(host = %host_id, vm = %vm_name, kind = kind.as_str(), error = %e, "No usable console target");
            return;
        }
    };

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host_id, vm = %vm_name, target = %format!("{host}:{port}"), error = %e, "Console dial failed");
            return;
        }
    };

    info!(host = %host_id, vm = %vm_name, kind = kind.as_str(), target = %format!("{host}:{port}"), "Console proxy established");
    splice(socket, stream).await;
    debug!(host = %host_id, vm = %vm_name, "Console proxy closed");
}

/// Find the graphics endpoint for the requested console kind and resolve
/// the address to dial.
async fn resolve_target(
    service: &ControlPlaneService,
    host_id: &str,
    vm_name: &str,
    kind: GraphicsKind,
) -> Result<(String, u16)> {
    let driver = service.pool().get(host_id).await?;
    let domain = driver.lookup_domain(vm_name).await?;
    let hardware = driver.hardware(&domain).await?;

    let device = hardware
        .graphics
        .iter()
        .find(|g| g.kind == kind)
        .ok_or_else(|| {
            ControlError::InvalidRequest(format!("no {} graphics device", kind.as_str()))
        })?;

    // SPICE prefers the TLS port when bound; the relay itself stays a
    // plain TCP splice either way.
    let port = match kind {
        GraphicsKind::Spice => device.tls_port.or(device.port),
        GraphicsKind::Vnc => device.port,
    }
    .ok_or_else(|| {
        ControlError::InvalidRequest(format!("{} console has no bound port", kind.as_str()))
    })?;

    let host_row = service
        .store()
        .get_host(host_id)
        .await?
        .ok_or_else(|| ControlError::NotConnected(host_id.to_string()))?;

    Ok((
        resolve_listen_address(device.listen.as_deref(), &host_row.uri),
        port,
    ))
}

/// A domain listening on a loopback or wildcard address is reachable at
/// the hypervisor's own address, taken from the stored connection URI.
/// Anything else is used verbatim.
pub(crate) fn resolve_listen_address(listen: Option<&str>, host_uri: &str) -> String {
    match listen {
        Some(addr) if !addr.is_empty() && addr != "127.0.0.1" && addr != "0.0.0.0" && addr != "::" => {
            addr.to_string()
        }
        _ => HypervisorUri::parse(host_uri)
            .ok()
            .and_then(|uri| uri.remote_host().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string()),
    }
}

/// Two concurrent copy loops between the WebSocket and the TCP socket.
/// The first direction to finish wins the select; dropping the other
/// future closes its halves, which unblocks and tears down everything.
async fn splice(socket: WebSocket, stream: TcpStream) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();

    let client_to_host = async {
        while let Some(frame) = ws_rx.next().await {
            let data = match frame {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if tcp_tx.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = tcp_tx.shutdown().await;
    };

    let host_to_client = async {
        let mut buffer = vec![0u8; COPY_BUFFER];
        loop {
            match tcp_rx.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buffer[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    };

    tokio::pin!(client_to_host, host_to_client);
    tokio::select! {
        _ = &mut client_to_host => {}
        _ = &mut host_to_client => {}
    }
}
