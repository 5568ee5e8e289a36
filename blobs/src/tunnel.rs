//! The per-tunnel state machine.
//!
//! Each tunnel is a single task that owns every piece of tunnel state: the
//! two peer slots, the metadata store, the download multiplexer and the idle
//! deadline. Sockets, HTTP handlers and download bodies talk to it through
//! [`TunnelHandle`] and the halves of a [`PeerSession`], which all feed one
//! command queue, so no tunnel state is ever shared or locked.
//!
//! ```text
//!  Empty ──connect──▶ OnePeer ──connect──▶ Paired
//!    ▲                 │   ▲                 │
//!    └───disconnect────┘   └───disconnect────┘
//! ```
//!
//! The deadline is independent of the state: it is pushed back on every
//! connect, and when it fires the tunnel closes its sockets, fails its
//! downloads, clears its store and stops.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use blobs_proto::{BlobId, BlobMetadata, DecodeError, Message, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::{CLEANUP_RETRY, RelayConfig, SESSION_TIMEOUT};
use crate::error::{Error, Result};
use crate::link::PeerSocket;
use crate::mux::{DownloadMux, Routed};
use crate::source::{BlobSource, Outstanding, Registration};
use crate::store::BlobStore;

/// Timers of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct TunnelSettings {
    /// Idle lifetime, counted from the most recent connect.
    pub session_timeout: Duration,
    /// Backoff after a failed cleanup.
    pub cleanup_retry: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            session_timeout: SESSION_TIMEOUT,
            cleanup_retry: CLEANUP_RETRY,
        }
    }
}

impl From<&RelayConfig> for TunnelSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            session_timeout: config.session_timeout(),
            cleanup_retry: config.cleanup_retry(),
        }
    }
}

/// How many peer slots are occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TunnelState {
    /// No socket attached.
    Empty,
    /// One socket attached.
    OnePeer,
    /// Both sockets attached.
    Paired,
}

/// Snapshot of a tunnel, see [`TunnelHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TunnelStatus {
    /// Slot occupancy.
    pub state: TunnelState,
    /// Connected peers, creator first.
    pub peers: Vec<PeerId>,
    /// Downloads in flight.
    pub downloads: usize,
}

/// Requests processed by the tunnel task, in arrival order.
#[derive(Debug)]
enum Command {
    /// Attach a socket to a slot.
    Connect {
        /// Slot to occupy.
        peer: PeerId,
        /// Receives the session.
        reply: oneshot::Sender<Result<PeerSession>>,
    },
    /// A message read from a peer socket.
    Inbound {
        /// Sender's slot.
        peer: PeerId,
        /// Sender's connection number.
        conn: u64,
        /// Decoded message.
        msg: Message,
    },
    /// A peer socket closed.
    Disconnect {
        /// Slot the socket held.
        peer: PeerId,
        /// Its connection number.
        conn: u64,
    },
    /// Start a download.
    Download {
        /// Blob to stream.
        id: BlobId,
        /// Receives the source.
        reply: oneshot::Sender<Result<BlobSource>>,
    },
    /// A download body was dropped.
    Release {
        /// Blob it streamed.
        id: BlobId,
        /// Its registration number.
        seq: u64,
    },
    /// Report occupancy.
    Status {
        /// Receives the snapshot.
        reply: oneshot::Sender<TunnelStatus>,
    },
    /// Clean up now.
    Expire,
}

/// Cloneable access to a running tunnel.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    /// Tunnel id.
    id: Arc<str>,
    /// Command queue of the tunnel task.
    commands: mpsc::UnboundedSender<Command>,
}

impl TunnelHandle {
    /// Starts a tunnel task on the current runtime.
    ///
    /// `on_close` runs once the task has stopped, after a successful cleanup
    /// or once every handle, session and download is gone.
    pub fn spawn(
        id: impl Into<Arc<str>>,
        settings: TunnelSettings,
        store: Box<dyn BlobStore>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let tunnel = Tunnel {
            settings,
            store,
            slots: [None, None],
            mux: DownloadMux::default(),
            commands: tx.downgrade(),
            next_conn: 0,
            next_download: 0,
            deadline: deadline_in(settings.session_timeout),
            expired: false,
        };
        let span = info_span!("tunnel", id = %id);
        tokio::spawn(
            async move {
                tunnel.run(rx).await;
                on_close();
            }
            .instrument(span),
        );
        Self { id, commands: tx }
    }

    /// Tunnel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attaches a socket to `peer`'s slot.
    ///
    /// Fails with [`Error::Capacity`] while the slot is held by another
    /// socket.
    pub async fn connect(&self, peer: PeerId) -> Result<PeerSession> {
        self.call(|reply| Command::Connect { peer, reply }).await?
    }

    /// Starts streaming an announced blob from its uploader.
    pub async fn download(&self, id: BlobId) -> Result<BlobSource> {
        self.call(|reply| Command::Download { id, reply }).await?
    }

    /// Current occupancy.
    pub async fn status(&self) -> Result<TunnelStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Runs the idle cleanup now instead of at the deadline.
    pub fn expire(&self) {
        let _ = self.commands.send(Command::Expire);
    }

    /// Whether the tunnel task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Sends a command carrying a reply channel and waits for the reply.
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }
}

/// Shortest pause between two cleanup attempts.
const MIN_CLEANUP_RETRY: Duration = Duration::from_secs(1);

/// Deadline used when `now + after` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + after`, saturating at a deadline that never fires in practice.
fn deadline_in(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Error for a tunnel whose task has stopped.
fn gone() -> Error {
    Error::NotFound("tunnel is gone".into())
}

/// A socket attached to a tunnel slot.
///
/// Split it between the task reading the socket and the task writing it.
#[derive(Debug)]
pub struct PeerSession {
    /// Read side.
    inbound: PeerInbound,
    /// Write side.
    outbound: PeerOutbound,
}

impl PeerSession {
    /// Slot the socket occupies.
    pub const fn peer(&self) -> PeerId {
        self.inbound.peer
    }

    /// Separates the read and write sides.
    pub fn split(self) -> (PeerInbound, PeerOutbound) {
        (self.inbound, self.outbound)
    }
}

/// Read side of a session: frames the socket received.
///
/// Dropping it detaches the socket from its slot.
#[derive(Debug)]
pub struct PeerInbound {
    /// Slot the socket occupies.
    peer: PeerId,
    /// Connection number, so a late message from a replaced socket is
    /// ignored.
    conn: u64,
    /// Command queue of the tunnel task.
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerInbound {
    /// Slot the socket occupies.
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    /// Decodes one binary frame and hands it to the tunnel.
    ///
    /// A frame that does not decode is returned as an error and otherwise
    /// ignored; the socket stays attached.
    pub fn deliver(&self, frame: &[u8]) -> std::result::Result<(), DecodeError> {
        let msg = blobs_proto::decode(frame)?;
        self.send(msg);
        Ok(())
    }

    /// Hands an already decoded message to the tunnel.
    pub fn send(&self, msg: Message) {
        let _ = self.commands.send(Command::Inbound {
            peer: self.peer,
            conn: self.conn,
            msg,
        });
    }
}

impl Drop for PeerInbound {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Disconnect {
            peer: self.peer,
            conn: self.conn,
        });
    }
}

/// Write side of a session: messages the tunnel wants on the socket.
#[derive(Debug)]
pub struct PeerOutbound {
    /// Closed by the tunnel when it drops the socket.
    rx: mpsc::UnboundedReceiver<Message>,
}

impl PeerOutbound {
    /// Next message to write. `None` means the socket should be closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next queued message, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// An occupied slot.
#[derive(Debug)]
struct Slot {
    /// Connection number of the attached socket.
    conn: u64,
    /// Its writer queue.
    socket: PeerSocket,
}

/// State owned by the tunnel task.
#[derive(Debug)]
struct Tunnel {
    /// Timers.
    settings: TunnelSettings,
    /// Announced metadata.
    store: Box<dyn BlobStore>,
    /// Indexed by [`PeerId::index`].
    slots: [Option<Slot>; 2],
    /// Downloads in flight.
    mux: DownloadMux,
    /// Weak so an idle tunnel does not keep its own queue open.
    commands: mpsc::WeakUnboundedSender<Command>,
    /// Last connection number handed out.
    next_conn: u64,
    /// Last download registration number handed out.
    next_download: u64,
    /// When the idle cleanup runs.
    deadline: Instant,
    /// Set once cleanup has started; nothing new may attach after that.
    expired: bool,
}

impl Tunnel {
    /// Processes commands until cleanup succeeds or every sender is gone.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("tunnel opened");
        loop {
            tokio::select! {
                next = commands.recv() => {
                    let Some(cmd) = next else {
                        debug!("no handles left");
                        if !self.sweep() {
                            warn!("stopping with metadata left in the store");
                        }
                        break;
                    };
                    if self.handle(cmd).is_break() {
                        break;
                    }
                }
                () = sleep_until(self.deadline) => {
                    info!("idle deadline reached");
                    if self.sweep() {
                        break;
                    }
                }
            }
        }
        info!("tunnel closed");
    }

    /// Applies one command.
    fn handle(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Connect { peer, reply } => {
                // A dropped reply drops the session, which detaches it again.
                let _ = reply.send(self.connect(peer));
            }
            Command::Inbound { peer, conn, msg } => self.inbound(peer, conn, msg),
            Command::Disconnect { peer, conn } => self.disconnect(peer, conn),
            Command::Download { id, reply } => {
                let _ = reply.send(self.download(id));
            }
            Command::Release { id, seq } => {
                if self.mux.unregister(&id, seq) {
                    debug!(blob = %id, seq, "download released");
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Expire => {
                info!("expiry requested");
                if self.sweep() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Occupies `peer`'s slot, notifies the other peer and replays its
    /// announcements to the newcomer.
    fn connect(&mut self, peer: PeerId) -> Result<PeerSession> {
        if self.expired {
            return Err(Error::NotFound("tunnel has expired".into()));
        }
        if self.slots[peer.index()].is_some() {
            warn!(%peer, "slot already taken");
            return Err(Error::Capacity);
        }
        let commands = self
            .commands
            .upgrade()
            .ok_or_else(|| Error::Internal("tunnel is shutting down".into()))?;

        self.next_conn += 1;
        let conn = self.next_conn;
        let (socket, rx) = PeerSocket::open(peer);

        if let Some(other) = self.slot(peer.other()) {
            other.socket.send(Message::PeerConnected);
            for meta in self.store.owned_by(peer.other()) {
                socket.send(Message::Metadata(meta));
            }
        }
        self.slots[peer.index()] = Some(Slot { conn, socket });
        self.deadline = deadline_in(self.settings.session_timeout);
        info!(%peer, conn, state = ?self.state(), "peer connected");

        Ok(PeerSession {
            inbound: PeerInbound {
                peer,
                conn,
                commands,
            },
            outbound: PeerOutbound { rx },
        })
    }

    /// Frees `peer`'s slot and fails the downloads it was serving.
    fn disconnect(&mut self, peer: PeerId, conn: u64) {
        if !self.is_current(peer, conn) {
            trace!(%peer, conn, "stale disconnect");
            return;
        }
        self.slots[peer.index()] = None;
        let failed = self.mux.close_owned_by(peer);
        if let Some(other) = self.slot(peer.other()) {
            other.socket.send(Message::PeerDisconnected);
        }
        info!(%peer, conn, failed, state = ?self.state(), "peer disconnected");

        if self.state() == TunnelState::Empty {
            self.mux.close_all();
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "could not clear metadata, leaving it for the deadline");
            }
        }
    }

    /// Dispatches a message read from a peer socket.
    fn inbound(&mut self, peer: PeerId, conn: u64, msg: Message) {
        if !self.is_current(peer, conn) {
            trace!(%peer, conn, "message from a detached socket");
            return;
        }
        match msg {
            Message::Metadata(meta) => self.announce(peer, meta),
            Message::DataChunk { .. } | Message::DataChunkEnd { .. } => {
                if msg.blob_id().is_some_and(|id| id.owner != peer) {
                    warn!(%peer, kind = msg.kind(), "chunk for a blob the peer does not own");
                    return;
                }
                match self.mux.route(msg) {
                    Routed::Finished => debug!(%peer, "download finished"),
                    Routed::Dropped => trace!(%peer, "chunk without a download"),
                    Routed::Delivered => {}
                }
            }
            Message::Keepalive => trace!(%peer, "keepalive"),
            other => debug!(%peer, kind = other.kind(), "ignoring message"),
        }
    }

    /// Stores a peer's own blob announcement and relays it.
    fn announce(&mut self, peer: PeerId, meta: BlobMetadata) {
        if meta.id.owner != peer {
            warn!(%peer, blob = %meta.id, "metadata for a blob the peer does not own");
            return;
        }
        if let Err(e) = self.store.put(meta.clone()) {
            warn!(%peer, blob = %meta.id, error = %e, "could not store metadata");
            return;
        }
        debug!(%peer, blob = %meta.id, name = %meta.name, size = meta.size, "blob announced");
        if let Some(other) = self.slot(peer.other()) {
            other.socket.send(Message::Metadata(meta));
        }
    }

    /// Registers a download of `id` and builds its source.
    fn download(&mut self, id: BlobId) -> Result<BlobSource> {
        if self.expired {
            return Err(Error::NotFound("tunnel has expired".into()));
        }
        let meta = self
            .store
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("no blob {id}")))?;
        let link = self
            .slot(id.owner)
            .map(|slot| slot.socket.link())
            .ok_or_else(|| Error::NotFound("uploader is not connected".into()))?;

        self.next_download += 1;
        let seq = self.next_download;
        let (tx, inbox) = mpsc::unbounded_channel();
        let outstanding = Outstanding::default();
        self.mux.register(id.clone(), seq, tx, outstanding.clone())?;
        debug!(blob = %id, seq, "download started");

        let commands = self.commands.clone();
        let registration = Registration::new(move || {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Release { id, seq });
            }
        });
        Ok(BlobSource::new(meta, link, inbox, outstanding, registration))
    }

    /// Closes sockets and downloads, then clears the store.
    ///
    /// Returns `true` when the tunnel may stop. On a store failure the
    /// deadline is moved out by the retry backoff.
    fn sweep(&mut self) -> bool {
        self.expired = true;
        let kicked = self.slots.iter_mut().filter_map(Option::take).count();
        let failed = self.mux.close_all();
        match self.store.clear() {
            Ok(()) => {
                info!(kicked, failed, "tunnel cleaned up");
                true
            }
            Err(e) => {
                let retry = self.settings.cleanup_retry.max(MIN_CLEANUP_RETRY);
                warn!(error = %e, retry_in = ?retry, "cleanup failed");
                self.deadline = deadline_in(retry);
                false
            }
        }
    }

    /// Occupancy snapshot.
    fn status(&self) -> TunnelStatus {
        TunnelStatus {
            state: self.state(),
            peers: PeerId::ALL
                .into_iter()
                .filter(|p| self.slot(*p).is_some())
                .collect(),
            downloads: self.mux.len(),
        }
    }

    /// Occupancy.
    fn state(&self) -> TunnelState {
        match self.slots.iter().flatten().count() {
            0 => TunnelState::Empty,
            1 => TunnelState::OnePeer,
            _ => TunnelState::Paired,
        }
    }

    /// The slot of `peer`, if occupied.
    fn slot(&self, peer: PeerId) -> Option<&Slot> {
        self.slots[peer.index()].as_ref()
    }

    /// Whether `conn` still holds `peer`'s slot.
    fn is_current(&self, peer: PeerId, conn: u64) -> bool {
        self.slot(peer).is_some_and(|slot| slot.conn == conn)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::error::{DownloadError, StoreError};
    use crate::store::MemoryStore;

    fn spawn() -> TunnelHandle {
        TunnelHandle::spawn(
            "t1",
            TunnelSettings::default(),
            Box::new(MemoryStore::default()),
            || {},
        )
    }

    fn meta(owner: PeerId, id: &str, name: &str, size: u64) -> BlobMetadata {
        BlobMetadata {
            id: BlobId::new(owner, id),
            name: name.into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    fn chunk(id: &BlobId, bytes: &'static [u8]) -> Message {
        Message::DataChunk {
            id: id.clone(),
            offset: 0,
            bytes: Bytes::from_static(bytes),
        }
    }

    /// Sends `msg` the way a socket would: encoded.
    fn deliver(inbound: &PeerInbound, msg: &Message) {
        inbound.deliver(&blobs_proto::encode(msg).unwrap()).unwrap();
    }

    fn drain(out: &mut PeerOutbound) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = out.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Answers one `DataRequest` like a browser reading a slice of a file.
    async fn answer(inbound: &PeerInbound, out: &mut PeerOutbound, id: &BlobId, bytes: &'static [u8]) {
        assert_eq!(
            out.recv().await,
            Some(Message::DataRequest { id: id.clone() })
        );
        deliver(inbound, &chunk(id, bytes));
        deliver(inbound, &Message::DataChunkEnd { id: id.clone() });
    }

    #[tokio::test]
    async fn second_socket_for_a_slot_is_rejected() {
        let tunnel = spawn();
        let a = tunnel.connect(PeerId::Creator).await.unwrap();
        assert!(matches!(
            tunnel.connect(PeerId::Creator).await,
            Err(Error::Capacity)
        ));
        let _b = tunnel.connect(PeerId::Joiner).await.unwrap();
        assert!(matches!(
            tunnel.connect(PeerId::Joiner).await,
            Err(Error::Capacity)
        ));

        let status = tunnel.status().await.unwrap();
        assert_eq!(status.state, TunnelState::Paired);
        assert_eq!(status.peers, [PeerId::Creator, PeerId::Joiner]);

        // The slot frees up once the first socket goes away.
        drop(a);
        assert!(tunnel.connect(PeerId::Creator).await.is_ok());
    }

    #[tokio::test]
    async fn pairing_is_announced_once_per_transition() {
        let tunnel = spawn();
        let (_a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        let b = tunnel.connect(PeerId::Joiner).await.unwrap();
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut a_out), [Message::PeerConnected]);

        drop(b);
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut a_out), [Message::PeerDisconnected]);

        let (_b_in, mut b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut a_out), [Message::PeerConnected]);
        assert!(drain(&mut b_out).is_empty());
    }

    #[tokio::test]
    async fn streams_a_blob_between_peers() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let announced = Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 9));

        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        deliver(&a_in, &announced);
        let (_b_in, mut b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut a_out), [Message::PeerConnected]);
        assert_eq!(drain(&mut b_out), [announced]);

        let source = tunnel.download(id.clone()).await.unwrap();
        assert_eq!(source.metadata().name, "a.txt");
        let body = tokio::spawn(source.into_stream().collect::<Vec<_>>());

        answer(&a_in, &mut a_out, &id, b"dmg-stuff").await;
        answer(&a_in, &mut a_out, &id, b"").await;

        let items = body.await.unwrap();
        assert_eq!(items, [Ok(Bytes::from_static(b"dmg-stuff"))]);
        assert_eq!(tunnel.status().await.unwrap().downloads, 0);
    }

    #[tokio::test]
    async fn uploader_leaving_mid_transfer_fails_the_body() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 9)));
        let (_b_in, mut b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();

        let source = tunnel.download(id.clone()).await.unwrap();
        let body = tokio::spawn(source.into_stream().collect::<Vec<_>>());
        assert!(matches!(
            a_out.recv().await,
            Some(Message::DataRequest { .. })
        ));
        deliver(&a_in, &chunk(&id, b"dmg-"));
        drop(a_in);

        let items = body.await.unwrap();
        assert_eq!(
            items,
            [
                Ok(Bytes::from_static(b"dmg-")),
                Err(DownloadError::PeerGone(id))
            ]
        );
        assert_eq!(a_out.recv().await, None);
        assert_eq!(
            tunnel.status().await.unwrap().state,
            TunnelState::OnePeer
        );
        assert_eq!(drain(&mut b_out).last(), Some(&Message::PeerDisconnected));
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let tunnel = spawn();
        let (a_in, _a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        assert!(a_in.deliver(&[]).is_err());
        assert!(a_in.deliver(&[0xff, 0x00]).is_err());
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));

        let (_b_in, mut b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut b_out).len(), 1);
    }

    #[tokio::test]
    async fn peers_cannot_speak_for_each_other() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        let (b_in, _b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();

        // The joiner claims one of the creator's blobs.
        deliver(&b_in, &Message::Metadata(meta(PeerId::Creator, "f1", "evil", 1)));
        tunnel.status().await.unwrap();
        assert_eq!(drain(&mut a_out), [Message::PeerConnected]);
        assert!(matches!(
            tunnel.download(id.clone()).await,
            Err(Error::NotFound(_))
        ));

        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 4)));
        let source = tunnel.download(id.clone()).await.unwrap();
        let body = tokio::spawn(source.into_stream().collect::<Vec<_>>());

        assert!(matches!(
            a_out.recv().await,
            Some(Message::DataRequest { .. })
        ));
        deliver(&b_in, &chunk(&id, b"evil"));
        deliver(&a_in, &chunk(&id, b"good"));
        deliver(&a_in, &Message::DataChunkEnd { id: id.clone() });
        answer(&a_in, &mut a_out, &id, b"").await;

        assert_eq!(body.await.unwrap(), [Ok(Bytes::from_static(b"good"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_end_marker_does_not_skip_a_request() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));

        let source = tunnel.download(id.clone()).await.unwrap();
        let body = tokio::spawn(source.into_stream().collect::<Vec<_>>());
        assert_eq!(
            a_out.recv().await,
            Some(Message::DataRequest { id: id.clone() })
        );
        deliver(&a_in, &chunk(&id, b"a"));
        deliver(&a_in, &Message::DataChunkEnd { id: id.clone() });
        deliver(&a_in, &Message::DataChunkEnd { id: id.clone() });
        deliver(&a_in, &chunk(&id, b"stray"));
        tunnel.status().await.unwrap();

        // One answered request earns exactly one more.
        assert_eq!(
            a_out.recv().await,
            Some(Message::DataRequest { id: id.clone() })
        );
        let more = tokio::time::timeout(Duration::from_millis(50), a_out.recv()).await;
        assert!(more.is_err(), "second request went out unanswered: {more:?}");

        deliver(&a_in, &chunk(&id, b""));
        deliver(&a_in, &Message::DataChunkEnd { id: id.clone() });
        assert_eq!(body.await.unwrap(), [Ok(Bytes::from_static(b"a"))]);
    }

    #[tokio::test]
    async fn duplicate_download_is_busy_until_released() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));
        let (b_in, _b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();

        let first = tunnel.download(id.clone()).await.unwrap();
        assert!(matches!(
            tunnel.download(id.clone()).await,
            Err(Error::Busy(_))
        ));
        drop(first);
        let second = tunnel.download(id.clone()).await.unwrap();
        assert_eq!(tunnel.status().await.unwrap().downloads, 1);

        // Cancelling leaves the uploader attached.
        drop(second);
        let status = tunnel.status().await.unwrap();
        assert_eq!(status.downloads, 0);
        assert_eq!(status.state, TunnelState::Paired);
        drain(&mut a_out);
        deliver(&b_in, &Message::Metadata(meta(PeerId::Joiner, "g", "b.txt", 1)));
        assert!(matches!(a_out.recv().await, Some(Message::Metadata(_))));
    }

    #[tokio::test]
    async fn download_needs_a_connected_uploader() {
        let tunnel = spawn();
        let a = tunnel.connect(PeerId::Creator).await.unwrap();
        let (_b_in, _b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();
        let (a_in, a_out) = a.split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));
        drop((a_in, a_out));

        let Err(Error::NotFound(msg)) = tunnel.download(BlobId::new(PeerId::Creator, "f1")).await
        else {
            panic!("expected NotFound");
        };
        assert!(msg.contains("not connected"), "{msg}");
    }

    #[tokio::test]
    async fn empty_tunnel_forgets_metadata() {
        let tunnel = spawn();
        let a = tunnel.connect(PeerId::Creator).await.unwrap();
        let (a_in, a_out) = a.split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));
        drop((a_in, a_out));
        assert_eq!(tunnel.status().await.unwrap().state, TunnelState::Empty);

        let _a = tunnel.connect(PeerId::Creator).await.unwrap();
        let (_b_in, mut b_out) = tunnel.connect(PeerId::Joiner).await.unwrap().split();
        tunnel.status().await.unwrap();
        assert!(drain(&mut b_out).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_pushes_the_deadline_back() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let tunnel = TunnelHandle::spawn(
            "t1",
            TunnelSettings {
                session_timeout: Duration::from_secs(10),
                cleanup_retry: Duration::from_secs(1),
            },
            Box::new(MemoryStore::default()),
            move || flag.store(true, Ordering::SeqCst),
        );
        let (_a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let _b = tunnel.connect(PeerId::Joiner).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tunnel.status().await.unwrap().state, TunnelState::Paired);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(closed.load(Ordering::SeqCst));
        assert!(tunnel.is_closed());
        assert!(matches!(tunnel.status().await, Err(Error::NotFound(_))));
        assert_eq!(drain(&mut a_out), [Message::PeerConnected]);
        assert_eq!(a_out.recv().await, None);
    }

    #[tokio::test]
    async fn expiry_fails_running_downloads() {
        let tunnel = spawn();
        let id = BlobId::new(PeerId::Creator, "f1");
        let (a_in, mut a_out) = tunnel.connect(PeerId::Creator).await.unwrap().split();
        deliver(&a_in, &Message::Metadata(meta(PeerId::Creator, "f1", "a.txt", 1)));

        let source = tunnel.download(id.clone()).await.unwrap();
        let body = tokio::spawn(source.into_stream().collect::<Vec<_>>());
        assert!(matches!(
            a_out.recv().await,
            Some(Message::DataRequest { .. })
        ));
        tunnel.expire();

        assert_eq!(body.await.unwrap(), [Err(DownloadError::TunnelClosed(id))]);
        assert_eq!(a_out.recv().await, None);
    }

    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl BlobStore for FlakyStore {
        fn put(&mut self, meta: BlobMetadata) -> std::result::Result<(), StoreError> {
            self.inner.put(meta)
        }

        fn get(&self, id: &BlobId) -> Option<BlobMetadata> {
            self.inner.get(id)
        }

        fn owned_by(&self, owner: PeerId) -> Vec<BlobMetadata> {
            self.inner.owned_by(owner)
        }

        fn clear(&mut self) -> std::result::Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures > 0 {
                self.failures -= 1;
                return Err(StoreError("unavailable".into()));
            }
            self.inner.clear()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cleanup_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let tunnel = TunnelHandle::spawn(
            "t1",
            TunnelSettings::default(),
            Box::new(FlakyStore {
                inner: MemoryStore::default(),
                failures: 2,
                attempts: Arc::clone(&attempts),
            }),
            move || flag.store(true, Ordering::SeqCst),
        );

        tunnel.expire();
        assert_eq!(tunnel.status().await.unwrap().state, TunnelState::Empty);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            tunnel.connect(PeerId::Creator).await,
            Err(Error::NotFound(_))
        ));

        tokio::time::sleep(CLEANUP_RETRY + Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!closed.load(Ordering::SeqCst));

        tokio::time::sleep(CLEANUP_RETRY).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(closed.load(Ordering::SeqCst));
        assert!(tunnel.status().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_still_backs_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let tunnel = TunnelHandle::spawn(
            "t1",
            TunnelSettings {
                session_timeout: Duration::from_secs(10),
                cleanup_retry: Duration::ZERO,
            },
            Box::new(FlakyStore {
                inner: MemoryStore::default(),
                failures: usize::MAX,
                attempts: Arc::clone(&attempts),
            }),
            || {},
        );

        tunnel.expire();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(MIN_CLEANUP_RETRY + Duration::from_millis(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow() {
        let tunnel = TunnelHandle::spawn(
            "t1",
            TunnelSettings {
                session_timeout: Duration::MAX,
                cleanup_retry: Duration::MAX,
            },
            Box::new(MemoryStore::default()),
            || {},
        );
        let _a = tunnel.connect(PeerId::Creator).await.unwrap();
        let _b = tunnel.connect(PeerId::Joiner).await.unwrap();
        assert_eq!(tunnel.status().await.unwrap().state, TunnelState::Paired);
    }
}
