// bases/device_portal/src/socket.rs
//! The `/os-upgrade` WebSocket
//!
//! Each connection becomes an [`Observer`]. Envelopes for it go through an
//! unbounded channel to a writer task, so delivery from the broadcaster never
//! waits on the network.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use os_updater::{Observer, ObserverGone, ObserverId, OsUpdater, PackageCache, TimeSync};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use updater_protocol::{Command, Envelope};

use crate::server::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// The broadcaster's handle on one connection
pub struct SocketObserver {
    id: ObserverId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(Self {
            id: ObserverId::next(),
            tx,
        });
        (observer, rx)
    }
}

impl Observer for SocketObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn deliver(&self, envelope: &Envelope) -> Result<(), ObserverGone> {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not encode {:?} envelope: {}", envelope.kind, e);
                return Ok(());
            }
        };
        self.tx.send(Outbound::Text(text)).map_err(|_| ObserverGone)
    }

    fn ping(&self) -> Result<(), ObserverGone> {
        self.tx.send(Outbound::Ping).map_err(|_| ObserverGone)
    }
}

pub async fn os_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

async fn serve(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (observer, mut outbound) = SocketObserver::new();
    info!("🔌 {} connected", observer.id());

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match message {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Ping => Message::Ping(Vec::new()),
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_command(&text, &observer, &state.updater),
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("🔌 {} disconnected", observer.id());
    state.updater.broadcaster().remove(observer.id());
    writer.abort();
}

/// Act on one inbound command. Size and state replies go to `observer` only.
pub fn handle_command<C, T>(text: &str, observer: &Arc<SocketObserver>, updater: &OsUpdater<C, T>)
where
    C: PackageCache,
    T: TimeSync,
{
    let command = match text.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring message from {}: {}", observer.id(), e);
            return;
        }
    };
    debug!("{} sent {}", observer.id(), command);

    match command {
        Command::UpdateSources => {
            updater.update_sources();
        }
        Command::Prepare => {
            updater.stage_packages(Vec::new());
        }
        Command::PrepareWebPortal => {
            updater.stage_web_portal_self();
        }
        Command::Start => {
            updater.start_upgrade();
        }
        Command::Size => reply(observer, Envelope::size(updater.upgrade_size())),
        Command::State => {
            let state = updater.state(Some(Arc::clone(observer) as Arc<dyn Observer>));
            reply(observer, Envelope::state(state.busy, state.clients));
        }
        Command::LegacyUpdaterBackend | Command::DefaultUpdaterBackend => {
            info!("Backend selection ({}) is not supported, ignoring", command);
        }
    }
}

fn reply(observer: &SocketObserver, envelope: Envelope) {
    if observer.deliver(&envelope).is_err() {
        debug!("{} went away before its reply", observer.id());
    }
}
