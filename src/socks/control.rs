//! Control channel between producers and the connector.
//!
//! Producers (the packet-routing layer, the control interface, resolver
//! callbacks) hold a cloneable [`ControlSender`]; the connector holds the
//! sole receiver. Messages are processed in arrival order.

use std::net::Ipv6Addr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Messages accepted by the connector.
#[derive(Debug)]
pub enum ControlMessage {
    /// Queue a connection request for a peer address.
    Connect { addr: Ipv6Addr, perm: bool },
    /// Force an immediate scheduling pass without changing any state.
    Wakeup,
    /// Ask for a human-readable listing of the queue. The reply is the
    /// listing bytes, terminated by a single zero byte.
    DumpQueue { reply: oneshot::Sender<Vec<u8>> },
}

/// Receiver half, owned by the connector.
pub type ControlRx = mpsc::Receiver<ControlMessage>;

/// Producer handle to the connector.
#[derive(Clone, Debug)]
pub struct ControlSender {
    tx: mpsc::Sender<ControlMessage>,
    /// When the connector is disabled, connection requests are no-ops.
    enabled: bool,
}

/// Create the control channel.
///
/// `enabled` reflects whether a proxy is configured; a disabled sender
/// still delivers wakeups and dump requests, but drops connect requests.
pub fn control_channel(capacity: usize, enabled: bool) -> (ControlSender, ControlRx) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlSender { tx, enabled }, rx)
}

impl ControlSender {
    /// Request a connection to a peer.
    ///
    /// No-op when the connector is disabled or the address is unspecified.
    pub async fn connect(&self, addr: Ipv6Addr, perm: bool) {
        if !self.enabled {
            debug!(addr = %addr, "connector disabled, dropping connection request");
            return;
        }
        if addr.is_unspecified() {
            warn!("refusing to queue the unspecified address");
            return;
        }
        if self
            .tx
            .send(ControlMessage::Connect { addr, perm })
            .await
            .is_err()
        {
            warn!(addr = %addr, "connector is gone, connection request dropped");
        }
    }

    /// Wake the connector for an immediate scheduling pass.
    pub async fn wakeup(&self) {
        if self.tx.send(ControlMessage::Wakeup).await.is_err() {
            warn!("connector is gone, wakeup dropped");
        }
    }

    /// Fetch the queue listing. `None` when the connector is gone.
    pub async fn dump_queue(&self) -> Option<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ControlMessage::DumpQueue { reply: reply_tx })
            .await
            .is_err()
        {
            warn!("connector is gone, dump request dropped");
            return None;
        }
        reply_rx.await.ok()
    }
}
