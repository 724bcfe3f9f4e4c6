use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::relay::protocol::ServerFrame;
use crate::relay::ticket::TicketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A remote client registered with the relay.
///
/// `outbound` feeds the connection's writer. It is bounded, and a connection
/// whose queue is full is skipped by the dispatcher until it drains.
#[derive(Debug)]
pub(crate) struct Connection {
    pub outbound: mpsc::Sender<ServerFrame>,
    /// Tickets currently delivered to this connection
    pub outstanding: BTreeSet<TicketId>,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            outbound,
            outstanding: BTreeSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn has_capacity(&self) -> bool {
        self.outbound.capacity() > 0
    }
}

/// The relay's side of a registered connection, held by the transport.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Frames the relay wants written to the client
    pub frames: mpsc::Receiver<ServerFrame>,
    /// Lets the transport queue replies behind pushed frames
    pub replies: mpsc::Sender<ServerFrame>,
}
