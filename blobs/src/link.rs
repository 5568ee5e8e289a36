//! Send halves of a peer socket.

use blobs_proto::{Message, PeerId};
use tokio::sync::mpsc;

/// The tunnel's owning handle on a peer socket's writer queue.
///
/// Dropping it closes the queue; the socket writer flushes what is left and
/// then closes the socket.
#[derive(Debug)]
pub(crate) struct PeerSocket {
    /// Slot the socket occupies.
    peer: PeerId,
    /// Writer queue.
    tx: mpsc::UnboundedSender<Message>,
}

impl PeerSocket {
    /// Creates the queue; the receiver goes to the socket writer.
    pub(crate) fn open(peer: PeerId) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peer, tx }, rx)
    }

    /// Queues `msg` for the socket.
    pub(crate) fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// A send-only reference that does not keep the socket open.
    pub(crate) fn link(&self) -> PeerLink {
        PeerLink {
            peer: self.peer,
            tx: self.tx.downgrade(),
        }
    }
}

/// Lets a download send on a peer socket it does not own.
///
/// Sends fail once the tunnel has dropped the socket.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// Slot the socket occupies.
    peer: PeerId,
    /// Writer queue, weakly held.
    tx: mpsc::WeakUnboundedSender<Message>,
}

impl PeerLink {
    /// Slot this link writes to.
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queues `msg`. Returns `false` once the socket is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.upgrade().is_some_and(|tx| tx.send(msg).is_ok())
    }
}
