//! One UI session per WebSocket client.
//!
//! The session registers with the event bus, writes outbound events in
//! order from its channel, and dispatches inbound subscribe/unsubscribe
//! messages. Any exit path (read error, write error, client close)
//! unregisters from the bus and releases every subscription.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::service::ControlPlaneService;
use crate::subscriptions::SessionId;

/// Inbound client message envelope.
#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<SubscriptionTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionTarget {
    host_id: String,
    vm_name: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<ControlPlaneService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, service))
}

async fn handle_session(socket: WebSocket, service: Arc<ControlPlaneService>) {
    let (session, mut events) = service.bus().register();
    info!(session, "UI session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drain the bus channel into the socket, in order.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            if ws_tx.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch(&service, session, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session, error = %e, "WebSocket read error");
                        break;
                    }
                }
            }
        }
    }

    service.bus().unregister(session);
    service.subscriptions().unsubscribe_all(session);
    writer.abort();
    info!(session, "UI session closed");
}

fn dispatch(service: &ControlPlaneService, session: SessionId, text: &str) {
    let message: InboundMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(session, error = %e, "Malformed client message");
            return;
        }
    };

    match (message.kind.as_str(), message.payload) {
        ("subscribe-vm-stats", Some(target)) => {
            service
                .subscriptions()
                .subscribe(session, &target.host_id, &target.vm_name);
        }
        ("unsubscribe-vm-stats", Some(target)) => {
            service
                .subscriptions()
                .unsubscribe(session, &target.host_id, &target.vm_name);
        }
        (kind, _) => warn!(session, kind, "Ignoring unknown client message"),
    }
}
