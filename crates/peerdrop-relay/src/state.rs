//! Shared relay state: the registry plus one writer queue per endpoint
//!
//! The registry sits behind a single mutex — the one coordination point for
//! membership mutations, so two simultaneous joins on a room cannot lose a
//! member. Mutations produce notifications; [`RelayState::dispatch`] delivers
//! them through the per-endpoint mpsc queues, cloning the senders out of the
//! map first so no lock is held across a send.

use peerdrop_core::{ClientMessage, Outbound, Registry, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

pub struct RelayState {
    registry: Mutex<Registry>,
    senders: RwLock<HashMap<String, mpsc::Sender<ServerMessage>>>,
}

impl RelayState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new()),
            senders: RwLock::new(HashMap::new()),
        })
    }

    /// Wire up a freshly accepted connection and tell it its id.
    pub(crate) async fn attach(&self, id: &str, tx: mpsc::Sender<ServerMessage>) {
        self.senders.write().await.insert(id.to_string(), tx);
        self.dispatch(vec![Outbound {
            to: id.to_string(),
            message: ServerMessage::Welcome { id: id.to_string() },
        }])
        .await;
    }

    /// Full disconnect cleanup: room exit, unregistration, writer removal.
    /// Safe against duplicate disconnect events.
    pub(crate) async fn disconnect(&self, id: &str) {
        self.senders.write().await.remove(id);
        let notifications = {
            let mut registry = self.registry.lock().await;
            let mut out = registry.leave(id);
            out.extend(registry.unregister(id));
            out
        };
        self.dispatch(notifications).await;
    }

    /// Route one envelope from an endpoint.
    pub async fn handle_message(&self, from: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::Register { name } => {
                let out = self.registry.lock().await.register(from, &name);
                self.dispatch(out).await;
            }
            ClientMessage::Join { room } => {
                let out = self.registry.lock().await.join(from, &room);
                self.dispatch(out).await;
            }
            ClientMessage::Leave => {
                let out = self.registry.lock().await.leave(from);
                self.dispatch(out).await;
            }
            ClientMessage::Who => {
                let devices = self.registry.lock().await.snapshot();
                self.dispatch(vec![Outbound {
                    to: from.to_string(),
                    message: ServerMessage::Devices { devices },
                }])
                .await;
            }
            ClientMessage::Signal { room, to, data } => {
                // the payload is opaque here; the relay never parses it
                if let Some(to) = to {
                    // unknown recipients are dropped silently; the sender's
                    // own session cleanup handles absence
                    self.dispatch(vec![Outbound {
                        to,
                        message: ServerMessage::Signal {
                            from: from.to_string(),
                            data,
                        },
                    }])
                    .await;
                } else if let Some(room) = room {
                    let members = self.registry.lock().await.room_members(&room);
                    let out = members
                        .into_iter()
                        .filter(|member| member != from)
                        .map(|to| Outbound {
                            to,
                            message: ServerMessage::Signal {
                                from: from.to_string(),
                                data: data.clone(),
                            },
                        })
                        .collect();
                    self.dispatch(out).await;
                } else {
                    debug!("signal from {} names no recipient, dropped", from);
                }
            }
            ClientMessage::FileShared(announcement) => {
                let members = self.registry.lock().await.room_members(&announcement.room);
                let out = members
                    .into_iter()
                    .filter(|member| member != from)
                    .map(|to| Outbound {
                        to,
                        message: ServerMessage::FileShared(announcement.clone()),
                    })
                    .collect();
                self.dispatch(out).await;
            }
        }
    }

    /// Deliver resolved notifications. Recipients that disappeared between
    /// resolution and delivery are skipped.
    async fn dispatch(&self, notifications: Vec<Outbound>) {
        if notifications.is_empty() {
            return;
        }
        let resolved: Vec<(mpsc::Sender<ServerMessage>, ServerMessage)> = {
            let senders = self.senders.read().await;
            notifications
                .into_iter()
                .filter_map(|out| senders.get(&out.to).map(|tx| (tx.clone(), out.message)))
                .collect()
        };
        for (tx, message) in resolved {
            if tx.send(message).await.is_err() {
                debug!("notification dropped, writer gone");
            }
        }
    }
}
