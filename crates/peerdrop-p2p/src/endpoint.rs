//! Relay client owning the per-peer negotiation and transfer state
//!
//! An [`Endpoint`] is one device on the network: a WebSocket connection to
//! the relay plus one [`NegotiationSession`] per remote peer, the channels
//! negotiation produced, and one [`TransferReceiver`] per channel. It runs
//! as an actor task: commands in over an mpsc handle, [`EndpointEvent`]s out
//! over an unbounded channel, relay frames and direct-channel frames
//! multiplexed in a `select!` loop. Nothing here blocks the loop; file
//! sends run in their own tasks so backpressure only ever suspends the
//! sending task for that one transfer.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use peerdrop_core::protocol::{ClientMessage, DeviceInfo, FileAnnouncement, ServerMessage};

use crate::negotiation::{NegotiationSession, SessionAction, SignalPayload};
use crate::transfer::{self, FileMeta, ReceivedFile, TransferError, TransferEvent, TransferReceiver};
use crate::transport::{DirectChannel, PeerConnector};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("relay connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("endpoint task is gone")]
    Closed,
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Everything an endpoint surfaces to its consumer.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The relay assigned us this connection id.
    Welcome { id: String },
    Devices { devices: BTreeMap<String, DeviceInfo> },
    RoomMembers { room: String, count: usize },
    PeerJoined { peer: String },
    PeerLeft { peer: String },
    /// Negotiation with the peer reached its terminal connected state.
    PeerConnected { peer: String },
    /// The session with the peer was torn down, with everything on it.
    PeerClosed { peer: String },
    PeerRenamed { peer: String, name: String },
    TransferStarted { peer: String, meta: FileMeta },
    TransferProgress { peer: String, pct: u8 },
    FileReceived { peer: String, file: ReceivedFile },
    SendProgress { peer: String, pct: u8 },
    FileShared(FileAnnouncement),
}

enum Command {
    Rename(String),
    Join(String),
    LeaveRoom,
    Who,
    Dial(String),
    HangUp(String),
    SendFile {
        meta: FileMeta,
        data: Bytes,
        reply: oneshot::Sender<Result<usize, TransferError>>,
    },
    Shutdown,
}

enum ChannelEvent {
    Frame(crate::transport::Frame),
    Closed,
}

/// Handle to a running endpoint actor.
pub struct Endpoint {
    cmd_tx: mpsc::Sender<Command>,
}

impl Endpoint {
    /// Connect to a relay, register under `name` and request a presence
    /// snapshot. Returns the command handle and the event stream.
    pub async fn connect(
        url: &str,
        name: &str,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EndpointEvent>), EndpointError> {
        let (ws, _) = connect_async(url).await?;
        let (ws_tx, ws_rx) = ws.split();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();

        let mut actor = Actor {
            name: name.to_string(),
            my_id: None,
            room: None,
            connector,
            sessions: HashMap::new(),
            channels: HashMap::new(),
            inbound: HashMap::new(),
            announced: HashSet::new(),
            channel_tx,
            event_tx,
            ws_tx,
        };
        tokio::spawn(async move {
            let register = ClientMessage::Register {
                name: actor.name.clone(),
            };
            actor.send_client(register).await;
            actor.send_client(ClientMessage::Who).await;
            actor.run(ws_rx, cmd_rx, channel_rx).await;
        });
        Ok((Endpoint { cmd_tx }, event_rx))
    }

    pub async fn rename(&self, name: impl Into<String>) -> Result<(), EndpointError> {
        self.send(Command::Rename(name.into())).await
    }

    pub async fn join(&self, room: impl Into<String>) -> Result<(), EndpointError> {
        self.send(Command::Join(room.into())).await
    }

    pub async fn leave_room(&self) -> Result<(), EndpointError> {
        self.send(Command::LeaveRoom).await
    }

    pub async fn who(&self) -> Result<(), EndpointError> {
        self.send(Command::Who).await
    }

    /// Initiate negotiation with a peer. A no-op if a session already exists
    /// and is not closed.
    pub async fn dial(&self, peer: impl Into<String>) -> Result<(), EndpointError> {
        self.send(Command::Dial(peer.into())).await
    }

    /// Cancel the session with a peer, telling them so.
    pub async fn hang_up(&self, peer: impl Into<String>) -> Result<(), EndpointError> {
        self.send(Command::HangUp(peer.into())).await
    }

    /// Fan a file out to every connected peer. Fails at the call boundary,
    /// with no side effects, when no channel is open. Returns how many
    /// channels the transfer was started on; progress and completion arrive
    /// as events. When the endpoint is in a room, a `file-shared`
    /// announcement goes to the room alongside the transfer.
    pub async fn send_file(&self, meta: FileMeta, data: Bytes) -> Result<usize, EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendFile { meta, data, reply }).await?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EndpointError::Closed),
        }
    }

    /// Shut the endpoint down, cancelling every session.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), EndpointError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EndpointError::Closed)
    }
}

struct Actor {
    name: String,
    my_id: Option<String>,
    room: Option<String>,
    connector: Arc<dyn PeerConnector>,
    /// One state machine per remote peer, keyed by connection id.
    sessions: HashMap<String, NegotiationSession>,
    channels: HashMap<String, Arc<dyn DirectChannel>>,
    inbound: HashMap<String, TransferReceiver>,
    /// Peers we already announced our name to and emitted `PeerConnected` for.
    announced: HashSet<String>,
    channel_tx: mpsc::UnboundedSender<(String, ChannelEvent)>,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
    ws_tx: WsSink,
}

impl Actor {
    async fn run(
        mut self,
        mut ws_rx: WsSource,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut channel_rx: mpsc::UnboundedReceiver<(String, ChannelEvent)>,
    ) {
        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_relay_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("relay socket error: {}", err);
                        break;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some((peer, event)) = channel_rx.recv() => {
                    self.on_channel_event(peer, event).await;
                }
            }
        }

        // losing the relay (or shutting down) cancels every session
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Some(actions) = self.sessions.get_mut(&peer).map(|s| s.cancel()) {
                self.run_actions(&peer, actions).await;
            }
        }
    }

    async fn on_relay_text(&mut self, text: &str) {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("unparseable relay frame: {}", err);
                return;
            }
        };
        match msg {
            ServerMessage::Welcome { id } => {
                self.my_id = Some(id.clone());
                self.emit(EndpointEvent::Welcome { id });
            }
            ServerMessage::Devices { devices } => self.emit(EndpointEvent::Devices { devices }),
            ServerMessage::RoomMembers { room, count } => {
                self.emit(EndpointEvent::RoomMembers { room, count })
            }
            ServerMessage::PeerJoined { peer } => self.emit(EndpointEvent::PeerJoined { peer }),
            ServerMessage::PeerLeft { peer } => {
                // a departed peer cancels any session naming it
                if let Some(actions) = self.sessions.get_mut(&peer).map(|s| s.cancel()) {
                    self.run_actions(&peer, actions).await;
                }
                self.emit(EndpointEvent::PeerLeft { peer });
            }
            ServerMessage::Signal { from, data } => self.on_signal(from, data).await,
            ServerMessage::FileShared(ann) => self.emit(EndpointEvent::FileShared(ann)),
        }
    }

    async fn on_signal(&mut self, from: String, data: serde_json::Value) {
        let payload: SignalPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("dropping malformed signal from {}: {}", from, err);
                return;
            }
        };
        if !self.sessions.contains_key(&from) {
            match payload {
                // offers and racing candidates may legitimately arrive first
                SignalPayload::Offer { .. } | SignalPayload::Candidate { .. } => {
                    self.sessions
                        .insert(from.clone(), NegotiationSession::new(from.clone()));
                }
                _ => {
                    debug!("dropping signal from {} with no session", from);
                    return;
                }
            }
        }
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };
        let actions = session.handle_signal(payload);
        self.run_actions(&from, actions).await;
    }

    /// Execute state-machine actions, feeding connector results back in
    /// until the queue drains. Ends by announcing a newly connected peer.
    async fn run_actions(&mut self, peer: &str, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::CreateOffer => match self.connector.create_offer(peer).await {
                    Ok((channel, offer)) => {
                        self.install_channel(peer, channel);
                        if let Some(s) = self.sessions.get_mut(peer) {
                            queue.extend(s.local_offer_ready(offer));
                        }
                    }
                    Err(err) => {
                        warn!("offer to {} failed: {}", peer, err);
                        if let Some(s) = self.sessions.get_mut(peer) {
                            queue.extend(s.transport_closed());
                        }
                    }
                },
                SessionAction::AcceptOffer(offer) => {
                    match self.connector.accept_offer(peer, &offer).await {
                        Ok((channel, answer)) => {
                            self.install_channel(peer, channel);
                            if let Some(s) = self.sessions.get_mut(peer) {
                                queue.extend(s.remote_offer_applied());
                                queue.extend(s.local_answer_ready(answer));
                            }
                        }
                        Err(err) => {
                            warn!("accepting offer from {} failed: {}", peer, err);
                            if let Some(s) = self.sessions.get_mut(peer) {
                                queue.extend(s.transport_closed());
                            }
                        }
                    }
                }
                SessionAction::ApplyAnswer(answer) => {
                    match self.connector.apply_answer(peer, &answer).await {
                        Ok(channel) => self.install_channel(peer, channel),
                        Err(err) => {
                            warn!("answer from {} failed: {}", peer, err);
                            if let Some(s) = self.sessions.get_mut(peer) {
                                queue.extend(s.transport_closed());
                            }
                        }
                    }
                }
                SessionAction::ApplyCandidate(candidate) => {
                    if let Err(err) = self.connector.add_candidate(peer, &candidate).await {
                        debug!("candidate for {} rejected: {}", peer, err);
                    }
                }
                SessionAction::SendSignal(payload) => self.send_signal(peer, &payload).await,
                SessionAction::Close => self.teardown_peer(peer).await,
            }
        }

        let connected = self
            .sessions
            .get(peer)
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if connected && self.announced.insert(peer.to_string()) {
            // identity announcement on transport open
            if let Some(channel) = self.channels.get(peer) {
                if let Err(err) = transfer::send_name(channel.as_ref(), &self.name).await {
                    debug!("name announcement to {} failed: {}", peer, err);
                }
            }
            self.emit(EndpointEvent::PeerConnected {
                peer: peer.to_string(),
            });
        }
    }

    fn install_channel(&mut self, peer: &str, channel: Arc<dyn DirectChannel>) {
        if self.channels.contains_key(peer) {
            return;
        }
        self.inbound.insert(peer.to_string(), TransferReceiver::new());
        self.channels.insert(peer.to_string(), channel.clone());

        let tx = self.channel_tx.clone();
        let peer_id = peer.to_string();
        tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Some(frame) => {
                        if tx.send((peer_id.clone(), ChannelEvent::Frame(frame))).is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = tx.send((peer_id.clone(), ChannelEvent::Closed));
                        break;
                    }
                }
            }
        });
    }

    async fn on_channel_event(&mut self, peer: String, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(frame) => {
                let Some(receiver) = self.inbound.get_mut(&peer) else {
                    return;
                };
                for ev in receiver.handle_frame(frame) {
                    let out = match ev {
                        TransferEvent::Started(meta) => EndpointEvent::TransferStarted {
                            peer: peer.clone(),
                            meta,
                        },
                        TransferEvent::Progress(pct) => EndpointEvent::TransferProgress {
                            peer: peer.clone(),
                            pct,
                        },
                        TransferEvent::Completed(file) => EndpointEvent::FileReceived {
                            peer: peer.clone(),
                            file,
                        },
                        TransferEvent::PeerRenamed(name) => EndpointEvent::PeerRenamed {
                            peer: peer.clone(),
                            name,
                        },
                    };
                    self.emit(out);
                }
            }
            ChannelEvent::Closed => {
                if let Some(actions) = self.sessions.get_mut(&peer).map(|s| s.transport_closed()) {
                    self.run_actions(&peer, actions).await;
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Rename(name) => {
                self.name = name.clone();
                self.send_client(ClientMessage::Register { name }).await;
                let channels: Vec<Arc<dyn DirectChannel>> =
                    self.channels.values().cloned().collect();
                for channel in channels {
                    if channel.is_open() {
                        if let Err(err) = transfer::send_name(channel.as_ref(), &self.name).await {
                            debug!("rename announcement failed: {}", err);
                        }
                    }
                }
            }
            Command::Join(room) => {
                self.room = Some(room.clone());
                self.send_client(ClientMessage::Join { room }).await;
            }
            Command::LeaveRoom => {
                self.room = None;
                self.send_client(ClientMessage::Leave).await;
            }
            Command::Who => self.send_client(ClientMessage::Who).await,
            Command::Dial(peer) => {
                if self.sessions.get(&peer).map(|s| s.is_closed()).unwrap_or(false) {
                    // a closed session may be replaced by a fresh dial
                    self.sessions.remove(&peer);
                }
                let actions = self
                    .sessions
                    .entry(peer.clone())
                    .or_insert_with(|| NegotiationSession::new(peer.clone()))
                    .initiate();
                self.run_actions(&peer, actions).await;
            }
            Command::HangUp(peer) => {
                self.send_signal(&peer, &SignalPayload::Cancel).await;
                if let Some(actions) = self.sessions.get_mut(&peer).map(|s| s.cancel()) {
                    self.run_actions(&peer, actions).await;
                }
            }
            Command::SendFile { meta, data, reply } => {
                let open: Vec<(String, Arc<dyn DirectChannel>)> = self
                    .channels
                    .iter()
                    .filter(|(_, c)| c.is_open())
                    .map(|(p, c)| (p.clone(), c.clone()))
                    .collect();
                if open.is_empty() {
                    let _ = reply.send(Err(TransferError::NoChannel));
                    return;
                }
                let count = open.len();
                for (peer, channel) in open {
                    let meta = meta.clone();
                    let data = data.clone();
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        let progress_peer = peer.clone();
                        let progress_tx = event_tx.clone();
                        let result = transfer::send_file(channel.as_ref(), &meta, &data, |pct| {
                            let _ = progress_tx.send(EndpointEvent::SendProgress {
                                peer: progress_peer.clone(),
                                pct,
                            });
                        })
                        .await;
                        if let Err(err) = result {
                            debug!("send to {} aborted: {}", peer, err);
                        }
                    });
                }
                if let (Some(room), Some(my_id)) = (self.room.clone(), self.my_id.clone()) {
                    let announcement = ClientMessage::FileShared(FileAnnouncement {
                        room,
                        name: meta.name.clone(),
                        size: meta.size,
                        sender: self.name.clone(),
                        sender_id: my_id,
                    });
                    self.send_client(announcement).await;
                }
                let _ = reply.send(Ok(count));
            }
            Command::Shutdown => {}
        }
    }

    async fn send_signal(&mut self, peer: &str, payload: &SignalPayload) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!("signal payload encoding failed: {}", err);
                return;
            }
        };
        self.send_client(ClientMessage::Signal {
            room: None,
            to: Some(peer.to_string()),
            data,
        })
        .await;
    }

    async fn send_client(&mut self, msg: ClientMessage) {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => {
                warn!("envelope encoding failed: {}", err);
                return;
            }
        };
        if let Err(err) = self.ws_tx.send(Message::Text(text)).await {
            debug!("relay send failed: {}", err);
        }
    }

    /// Release everything tied to a peer: the state machine, the direct
    /// channel, and any transfer riding on it.
    async fn teardown_peer(&mut self, peer: &str) {
        self.sessions.remove(peer);
        self.announced.remove(peer);
        if let Some(mut receiver) = self.inbound.remove(peer) {
            receiver.abort();
        }
        if let Some(channel) = self.channels.remove(peer) {
            channel.close().await;
        }
        self.emit(EndpointEvent::PeerClosed {
            peer: peer.to_string(),
        });
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.event_tx.send(event);
    }
}
