//! Push/pull bridge between the engine and remote clients.
//!
//! The relay is bound to the engine as its acknowledge listener. Every record
//! it receives becomes a [`DeliveryTicket`] holding the record's
//! acknowledgment; the ticket is completed when a remote client acks it, or
//! dead-lettered once it has failed `max_attempts` deliveries. Either way the
//! acknowledgment fires and the offset becomes committable.
//!
//! All ticket state lives behind one mutex. Acknowledgments, dead-letter
//! writes and sends to a connection happen after that lock is released.
//! Only the connection a ticket is currently delivered to may acknowledge it.

pub mod connection;
pub mod protocol;
pub mod ticket;
pub mod transport;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dead_letter::{DeadLetterError, DeadLetterId, DeadLetterSink};
use crate::engine::ProxyMode;
use crate::error::{ConfigurationError, UsageError};
use crate::listener::{AcknowledgeListener, Acknowledgment};
use crate::metrics_consts::{
    ACKS_REJECTED_COUNTER, ACK_LATENCY_HISTOGRAM, RELAY_CONNECTIONS_GAUGE, TICKETS_ACKED_COUNTER,
    TICKETS_DISPATCHED_COUNTER, TICKETS_IN_FLIGHT_GAUGE, TICKETS_REDISPATCHED_COUNTER,
};
use crate::record::{Partition, Record};

use connection::Connection;
pub use connection::{ConnectionHandle, ConnectionId};
use protocol::{Delivery, ServerFrame};
pub use ticket::{DeliveryFailure, TicketId};
use ticket::DeliveryTicket;

/// How often a dispatcher held up by full send queues looks again
const DISPATCH_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The relay sends records to connected clients as they arrive
    Push,
    /// Clients ask for records
    Pull,
}

impl DeliveryMode {
    pub fn from_proxy_mode(mode: ProxyMode) -> Option<Self> {
        match mode {
            ProxyMode::Disabled => None,
            ProxyMode::Push => Some(DeliveryMode::Push),
            ProxyMode::Pull => Some(DeliveryMode::Pull),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Deliveries attempted before a record is dead-lettered
    pub max_attempts: u32,
    pub ack_timeout: Duration,
    /// Tickets allowed at once; the poll thread waits when this is reached
    pub max_in_flight: usize,
    /// Frames buffered per connection; a full connection is passed over
    pub send_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(30),
            max_in_flight: 1000,
            send_queue_capacity: 128,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::NonPositive("max_attempts"));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigurationError::NonPositive("ack_timeout"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigurationError::NonPositive("max_in_flight"));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigurationError::NonPositive("send_queue_capacity"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub in_flight: usize,
    pub pending: usize,
    pub connections: usize,
    pub available_permits: usize,
}

/// Why an acknowledgment was not accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRejection {
    /// Never issued, or already acknowledged or dead-lettered
    #[error("unknown or already settled ticket")]
    UnknownTicket,

    /// The ticket is waiting for delivery or out with another connection
    #[error("ticket is not outstanding on connection {0}")]
    NotDeliveredTo(ConnectionId),
}

impl AckRejection {
    fn label(&self) -> &'static str {
        match self {
            AckRejection::UnknownTicket => "unknown_ticket",
            AckRejection::NotDeliveredTo(_) => "not_delivered",
        }
    }
}

/// Where the dispatcher can send a ticket.
enum Selection {
    Ready(ConnectionId, OwnedPermit<ServerFrame>),
    /// Open connections exist but none that may take the ticket has room
    Saturated,
    NoConnection,
}

#[derive(Default)]
struct RelayState {
    tickets: HashMap<TicketId, DeliveryTicket>,
    /// Tickets waiting for a connection, in dispatch order
    pending: VecDeque<TicketId>,
    connections: BTreeMap<ConnectionId, Connection>,
    /// Partition pinned to the connection holding its outstanding tickets
    leases: HashMap<Partition, ConnectionId>,
    rotation: usize,
}

impl RelayState {
    /// Put a failed ticket back at the head of the queue, keeping the
    /// partition's tickets in offset order.
    fn requeue(&mut self, id: TicketId) {
        let Some((partition, offset)) = self
            .tickets
            .get(&id)
            .map(|t| (t.partition(), t.record.offset))
        else {
            return;
        };

        let mut insert_at = 0;
        for (pos, pending_id) in self.pending.iter().enumerate() {
            match self.tickets.get(pending_id) {
                Some(other) if other.partition() == partition => {
                    if other.record.offset > offset {
                        insert_at = pos;
                        break;
                    }
                    insert_at = pos + 1;
                }
                _ => {}
            }
        }
        self.pending.insert(insert_at, id);
    }

    /// Detach a ticket from the connection it was delivered to, and drop the
    /// partition lease once the connection holds nothing else from it.
    fn release(&mut self, connection_id: ConnectionId, id: TicketId, partition: &Partition) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        connection.outstanding.remove(&id);

        let still_leased = connection
            .outstanding
            .iter()
            .any(|other| self.tickets.get(other).is_some_and(|t| t.partition() == *partition));
        if !still_leased && self.leases.get(partition) == Some(&connection_id) {
            self.leases.remove(partition);
        }
    }

    /// Open connection with room in its send queue and the fewest
    /// outstanding tickets, rotating the starting point so ties are spread
    /// round robin.
    fn least_loaded(&mut self) -> Option<ConnectionId> {
        let open: Vec<(ConnectionId, usize)> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_open() && c.has_capacity())
            .map(|(id, c)| (*id, c.outstanding.len()))
            .collect();
        if open.is_empty() {
            return None;
        }

        let start = self.rotation % open.len();
        self.rotation = self.rotation.wrapping_add(1);
        open.iter()
            .cycle()
            .skip(start)
            .take(open.len())
            .min_by_key(|(_, load)| *load)
            .map(|(id, _)| *id)
    }

    fn reserve(&self, connection_id: ConnectionId) -> Selection {
        let Some(connection) = self.connections.get(&connection_id) else {
            return Selection::NoConnection;
        };
        match connection.outbound.clone().try_reserve_owned() {
            Ok(slot) => Selection::Ready(connection_id, slot),
            // Full, or the writer is gone and a disconnect is on its way
            Err(_) => Selection::Saturated,
        }
    }

    fn select_connection(&mut self, partition: &Partition, orderly: bool) -> Selection {
        if orderly {
            if let Some(leased) = self.leases.get(partition).copied() {
                if self.connections.get(&leased).is_some_and(Connection::is_open) {
                    return self.reserve(leased);
                }
                self.leases.remove(partition);
            }
        }

        let Some(chosen) = self.least_loaded() else {
            return if self.connections.values().any(Connection::is_open) {
                Selection::Saturated
            } else {
                Selection::NoConnection
            };
        };
        let selection = self.reserve(chosen);
        if orderly && matches!(selection, Selection::Ready(..)) {
            self.leases.insert(partition.clone(), chosen);
        }
        selection
    }
}

/// A ticket that left the relay for good.
enum Settled {
    Acknowledged(DeliveryTicket),
    Exhausted(DeliveryTicket),
}

struct RelayInner {
    mode: DeliveryMode,
    config: RelayConfig,
    partition_orderly: bool,
    state: Mutex<RelayState>,
    permits: Arc<Semaphore>,
    next_ticket: AtomicU64,
    next_connection: AtomicU64,
    dead_letters: Arc<DeadLetterSink>,
    dispatch_needed: Notify,
    shutdown: CancellationToken,
    runtime: OnceLock<Handle>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ProxyRelay {
    inner: Arc<RelayInner>,
}

impl ProxyRelay {
    pub fn new(
        mode: DeliveryMode,
        config: RelayConfig,
        partition_orderly: bool,
        dead_letters: Arc<DeadLetterSink>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            inner: Arc::new(RelayInner {
                mode,
                config,
                partition_orderly,
                state: Mutex::new(RelayState::default()),
                permits,
                next_ticket: AtomicU64::new(1),
                next_connection: AtomicU64::new(1),
                dead_letters,
                dispatch_needed: Notify::new(),
                shutdown: CancellationToken::new(),
                runtime: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.inner.dead_letters
    }

    /// Capture the runtime used for ack timers and, in push mode, start the
    /// dispatcher. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), UsageError> {
        let handle = Handle::try_current().map_err(|_| UsageError::NoRuntime)?;
        if self.inner.runtime.set(handle.clone()).is_err() {
            return Ok(());
        }

        if self.inner.mode == DeliveryMode::Push {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.run_dispatcher().await });
        }
        info!(
            mode = ?self.inner.mode,
            max_attempts = self.inner.config.max_attempts,
            ack_timeout_ms = self.inner.config.ack_timeout.as_millis() as u64,
            max_in_flight = self.inner.config.max_in_flight,
            "Proxy relay started"
        );
        Ok(())
    }

    /// Register a remote client. Frames for it arrive on the returned handle.
    pub fn connect(&self) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(self.inner.config.send_queue_capacity);
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::SeqCst));

        let connections = {
            let mut state = self.inner.lock();
            state.connections.insert(id, Connection::new(tx.clone()));
            state.connections.len()
        };
        metrics::gauge!(RELAY_CONNECTIONS_GAUGE).set(connections as f64);
        info!(connection_id = %id, connections, "Remote client connected");

        self.inner.dispatch_needed.notify_one();
        ConnectionHandle {
            id,
            frames: rx,
            replies: tx,
        }
    }

    /// Forget a connection. Its outstanding tickets count as failed attempts
    /// and are redelivered or dead-lettered.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.inner.disconnect(connection_id);
    }

    /// Complete a ticket on behalf of the connection it was delivered to.
    pub fn acknowledge(
        &self,
        connection_id: ConnectionId,
        ticket_id: TicketId,
    ) -> Result<(), AckRejection> {
        self.inner.acknowledge(connection_id, ticket_id)
    }

    /// Hand up to `max_records` waiting records to a pull-mode client.
    pub fn pull(&self, connection_id: ConnectionId, max_records: usize) -> Vec<Delivery> {
        self.inner.pull(connection_id, max_records)
    }

    /// Look up a dead-lettered record without consuming it.
    pub fn view(&self, message_id: DeadLetterId) -> Option<Record> {
        self.lookup(message_id).ok()
    }

    /// Like [`ProxyRelay::view`], saying why nothing was found.
    pub fn lookup(&self, message_id: DeadLetterId) -> Result<Record, DeadLetterError> {
        self.inner
            .dead_letters
            .get(message_id)
            .map(|entry| entry.record.clone())
    }

    pub fn stats(&self) -> RelayStats {
        let state = self.inner.lock();
        RelayStats {
            in_flight: state.tickets.len(),
            pending: state.pending.len(),
            connections: state.connections.len(),
            available_permits: self.inner.permits.available_permits(),
        }
    }

    /// Cancelled once the relay is closed.
    pub fn closed_signal(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop dispatching, drop every connection and unblock a poll thread
    /// waiting for capacity. Unsettled tickets are dropped without being
    /// acknowledged, so their records are redelivered by the broker later.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.permits.close();

        let (mut tickets, connections) = {
            let mut state = self.inner.lock();
            let tickets: Vec<DeliveryTicket> = state.tickets.drain().map(|(_, t)| t).collect();
            state.pending.clear();
            state.leases.clear();
            let connections = std::mem::take(&mut state.connections);
            (tickets, connections)
        };

        for ticket in &mut tickets {
            ticket.cancel_timer();
        }
        metrics::gauge!(RELAY_CONNECTIONS_GAUGE).set(0.0);
        metrics::gauge!(TICKETS_IN_FLIGHT_GAUGE).set(0.0);
        info!(
            unacknowledged = tickets.len(),
            connections = connections.len(),
            "Proxy relay closed"
        );
    }
}

impl AcknowledgeListener for ProxyRelay {
    fn on_message(&self, record: Record, ack: Acknowledgment) -> Result<()> {
        let permit = self.inner.acquire_permit()?;
        self.inner.enqueue(record, ack, permit)
    }
}

impl RelayInner {
    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(DeliveryFailure::RelayClosed.into()),
            Err(TryAcquireError::NoPermits) => {
                let handle = self
                    .runtime
                    .get()
                    .ok_or_else(|| anyhow!("proxy relay has not been started"))?;
                debug!(
                    max_in_flight = self.config.max_in_flight,
                    "In-flight limit reached, waiting for acknowledgments"
                );
                handle
                    .block_on(self.permits.clone().acquire_owned())
                    .map_err(|_| anyhow::Error::from(DeliveryFailure::RelayClosed))
            }
        }
    }

    fn enqueue(&self, record: Record, ack: Acknowledgment, permit: OwnedSemaphorePermit) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryFailure::RelayClosed.into());
        }

        let id = TicketId(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        let in_flight = {
            let mut state = self.lock();
            state
                .tickets
                .insert(id, DeliveryTicket::new(id, record, ack, permit));
            state.pending.push_back(id);
            state.tickets.len()
        };
        metrics::gauge!(TICKETS_IN_FLIGHT_GAUGE).set(in_flight as f64);

        if self.mode == DeliveryMode::Push {
            self.dispatch_needed.notify_one();
        }
        Ok(())
    }

    async fn run_dispatcher(self: Arc<Self>) {
        debug!("Relay dispatcher started");
        loop {
            let stalled = self.dispatch_pending();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.dispatch_needed.notified() => {}
                _ = tokio::time::sleep(DISPATCH_RETRY_INTERVAL), if stalled => {}
            }
        }
        debug!("Relay dispatcher stopped");
    }

    /// Push every pending ticket that has a connection with room for it.
    /// Returns true when tickets were left behind because send queues were
    /// full.
    fn dispatch_pending(self: &Arc<Self>) -> bool {
        let mut sends: Vec<(OwnedPermit<ServerFrame>, ServerFrame)> = Vec::new();
        let mut stalled = false;
        {
            let mut state = self.lock();
            // Partitions whose leased connection is full keep their order
            let mut blocked: HashSet<Partition> = HashSet::new();
            let mut pos = 0;
            while pos < state.pending.len() && !self.shutdown.is_cancelled() {
                let ticket_id = state.pending[pos];
                let Some(partition) = state.tickets.get(&ticket_id).map(DeliveryTicket::partition)
                else {
                    state.pending.remove(pos);
                    continue;
                };
                if blocked.contains(&partition) {
                    pos += 1;
                    continue;
                }

                match state.select_connection(&partition, self.partition_orderly) {
                    Selection::Ready(connection_id, slot) => {
                        state.pending.remove(pos);
                        let attempt = self.begin_attempt(&mut state, ticket_id, connection_id);
                        if let Some((frame, _)) = attempt {
                            sends.push((slot, frame));
                        }
                    }
                    Selection::Saturated => {
                        stalled = true;
                        if !self.partition_orderly {
                            break;
                        }
                        blocked.insert(partition);
                        pos += 1;
                    }
                    Selection::NoConnection => break,
                }
            }
        }

        for (slot, frame) in sends {
            slot.send(frame);
        }
        stalled
    }

    /// Record a delivery attempt and arm its ack timer.
    fn begin_attempt(
        self: &Arc<Self>,
        state: &mut RelayState,
        ticket_id: TicketId,
        connection_id: ConnectionId,
    ) -> Option<(ServerFrame, u32)> {
        let timer_handle = self.runtime.get().cloned().or_else(|| Handle::try_current().ok());
        let ticket = state.tickets.get_mut(&ticket_id)?;
        let attempt = ticket.mark_dispatched(connection_id);
        ticket.timer = timer_handle.map(|handle| {
            self.arm_timer(&handle, ticket_id, attempt, connection_id)
        });

        debug!(
            ticket_id = %ticket_id,
            connection_id = %connection_id,
            topic = ticket.record.topic,
            partition = ticket.record.partition,
            offset = ticket.record.offset,
            attempt,
            "Dispatching record"
        );
        let frame = ServerFrame::Push {
            ticket_id,
            record: ticket.record.clone(),
        };
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.outstanding.insert(ticket_id);
        }
        metrics::counter!(TICKETS_DISPATCHED_COUNTER).increment(1);
        Some((frame, attempt))
    }

    fn arm_timer(
        self: &Arc<Self>,
        handle: &Handle,
        ticket_id: TicketId,
        attempt: u32,
        connection_id: ConnectionId,
    ) -> AbortHandle {
        let relay: Weak<RelayInner> = Arc::downgrade(self);
        let timeout = self.config.ack_timeout;
        handle
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(relay) = relay.upgrade() {
                    relay.fail_delivery(
                        ticket_id,
                        attempt,
                        DeliveryFailure::AckTimeout(connection_id, timeout.as_millis()),
                    );
                }
            })
            .abort_handle()
    }

    fn pull(self: &Arc<Self>, connection_id: ConnectionId, max_records: usize) -> Vec<Delivery> {
        if self.mode != DeliveryMode::Pull {
            warn!(connection_id = %connection_id, "Pull request on a push-mode relay");
            return vec![];
        }

        let mut state = self.lock();
        if !state.connections.contains_key(&connection_id) {
            return vec![];
        }

        let mut deliveries = Vec::new();
        let mut skipped = VecDeque::new();
        while deliveries.len() < max_records {
            let Some(ticket_id) = state.pending.pop_front() else {
                break;
            };
            let Some(partition) = state.tickets.get(&ticket_id).map(DeliveryTicket::partition) else {
                continue;
            };

            if self.partition_orderly {
                let owner = state.leases.get(&partition).copied();
                match owner {
                    Some(owner) if owner != connection_id && state.connections.contains_key(&owner) => {
                        skipped.push_back(ticket_id);
                        continue;
                    }
                    _ => {
                        state.leases.insert(partition, connection_id);
                    }
                }
            }

            if let Some((ServerFrame::Push { ticket_id, record }, _)) =
                self.begin_attempt(&mut state, ticket_id, connection_id)
            {
                deliveries.push(Delivery { ticket_id, record });
            }
        }

        // Tickets owned by another connection keep their place in line
        while let Some(ticket_id) = skipped.pop_back() {
            state.pending.push_front(ticket_id);
        }
        deliveries
    }

    fn acknowledge(
        &self,
        connection_id: ConnectionId,
        ticket_id: TicketId,
    ) -> Result<(), AckRejection> {
        let settled = {
            let mut state = self.lock();
            let rejection = match state.tickets.get(&ticket_id) {
                None => Some(AckRejection::UnknownTicket),
                Some(ticket) if ticket.destination != Some(connection_id) => {
                    Some(AckRejection::NotDeliveredTo(connection_id))
                }
                Some(_) => None,
            };
            if let Some(rejection) = rejection {
                warn!(
                    ticket_id = %ticket_id,
                    connection_id = %connection_id,
                    "Rejected ack: {}",
                    rejection
                );
                metrics::counter!(ACKS_REJECTED_COUNTER, "reason" => rejection.label())
                    .increment(1);
                return Err(rejection);
            }

            let Some(mut ticket) = state.tickets.remove(&ticket_id) else {
                return Err(AckRejection::UnknownTicket);
            };
            ticket.cancel_timer();
            state.release(connection_id, ticket_id, &ticket.partition());
            metrics::gauge!(TICKETS_IN_FLIGHT_GAUGE).set(state.tickets.len() as f64);
            Settled::Acknowledged(ticket)
        };

        self.settle(settled);
        self.dispatch_needed.notify_one();
        Ok(())
    }

    fn fail_delivery(&self, ticket_id: TicketId, attempt: u32, failure: DeliveryFailure) {
        let settled = {
            let mut state = self.lock();
            let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
                return;
            };
            let destination = ticket.destination;
            if !ticket.mark_failed(attempt, failure.clone()) {
                return;
            }
            let partition = ticket.partition();
            let exhausted = ticket.attempt_count >= self.config.max_attempts;

            warn!(
                ticket_id = %ticket_id,
                offset = ticket.record.offset,
                attempt,
                exhausted,
                "Delivery failed: {}",
                failure
            );
            metrics::counter!(TICKETS_REDISPATCHED_COUNTER, "reason" => failure.label())
                .increment(1);

            if let Some(connection_id) = destination {
                state.release(connection_id, ticket_id, &partition);
            }
            if exhausted {
                state.tickets.remove(&ticket_id).map(Settled::Exhausted)
            } else {
                state.requeue(ticket_id);
                None
            }
        };

        if let Some(settled) = settled {
            self.settle(settled);
        }
        self.dispatch_needed.notify_one();
    }

    fn disconnect(&self, connection_id: ConnectionId) {
        let exhausted = {
            let mut state = self.lock();
            let Some(connection) = state.connections.remove(&connection_id) else {
                return;
            };
            state.leases.retain(|_, owner| *owner != connection_id);

            let mut outstanding: Vec<(Partition, i64, TicketId)> = connection
                .outstanding
                .iter()
                .filter_map(|id| {
                    state
                        .tickets
                        .get(id)
                        .map(|t| (t.partition(), t.record.offset, *id))
                })
                .collect();
            outstanding.sort();

            info!(
                connection_id = %connection_id,
                outstanding = outstanding.len(),
                connections = state.connections.len(),
                "Remote client disconnected"
            );
            metrics::gauge!(RELAY_CONNECTIONS_GAUGE).set(state.connections.len() as f64);

            let mut exhausted = Vec::new();
            for (_, _, ticket_id) in outstanding {
                let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
                    continue;
                };
                let attempt = ticket.attempt_count;
                if !ticket.mark_failed(attempt, DeliveryFailure::Disconnected(connection_id)) {
                    continue;
                }
                metrics::counter!(TICKETS_REDISPATCHED_COUNTER, "reason" => "disconnected")
                    .increment(1);

                if attempt >= self.config.max_attempts {
                    if let Some(ticket) = state.tickets.remove(&ticket_id) {
                        exhausted.push(ticket);
                    }
                } else {
                    state.requeue(ticket_id);
                }
            }
            exhausted
        };

        for ticket in exhausted {
            self.settle(Settled::Exhausted(ticket));
        }
        self.dispatch_needed.notify_one();
    }

    fn settle(&self, settled: Settled) {
        match settled {
            Settled::Acknowledged(ticket) => {
                metrics::histogram!(ACK_LATENCY_HISTOGRAM)
                    .record(ticket.created_at.elapsed().as_secs_f64());
                metrics::counter!(TICKETS_ACKED_COUNTER).increment(1);
                debug!(
                    ticket_id = %ticket.id,
                    offset = ticket.record.offset,
                    attempts = ticket.attempt_count,
                    "Ticket acknowledged"
                );
                ticket.ack.acknowledge();
            }
            Settled::Exhausted(ticket) => {
                let reason = ticket.failure_reason();
                let DeliveryTicket {
                    record,
                    ack,
                    attempt_count,
                    ..
                } = ticket;
                match self.dead_letters.put(record, reason, attempt_count) {
                    // Dead-lettered records are terminally handled
                    Ok(_) => {
                        ack.acknowledge();
                    }
                    Err(e) => warn!("Leaving exhausted record uncommitted: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cursor::OffsetLedger;
    use crate::record::OffsetCommit;

    fn config(max_attempts: u32, ack_timeout: Duration) -> RelayConfig {
        RelayConfig {
            max_attempts,
            ack_timeout,
            ..RelayConfig::default()
        }
    }

    fn relay(mode: DeliveryMode, config: RelayConfig, orderly: bool) -> (ProxyRelay, Arc<OffsetLedger>) {
        let relay = ProxyRelay::new(mode, config, orderly, Arc::new(DeadLetterSink::default()));
        (relay, Arc::new(OffsetLedger::new()))
    }

    fn offer(relay: &ProxyRelay, ledger: &Arc<OffsetLedger>, partition: i32, offset: i64) {
        let record = Record::new("events", partition, offset, None, Some(vec![offset as u8]), None);
        let ack = ledger.track(&record);
        relay.on_message(record, ack).unwrap();
    }

    async fn next_push(handle: &mut ConnectionHandle) -> (TicketId, Record) {
        let frame = tokio::time::timeout(Duration::from_secs(2), handle.frames.recv())
            .await
            .expect("timed out waiting for a push")
            .expect("connection closed");
        match frame {
            ServerFrame::Push { ticket_id, record } => (ticket_id, record),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_then_ack_commits() {
        let (relay, ledger) = relay(DeliveryMode::Push, RelayConfig::default(), false);
        relay.start().unwrap();
        let mut conn = relay.connect();

        offer(&relay, &ledger, 0, 7);
        let (ticket_id, record) = next_push(&mut conn).await;
        assert_eq!(record.offset, 7);
        assert!(ledger.take_commits().is_empty());

        assert_eq!(relay.acknowledge(conn.id, ticket_id), Ok(()));
        assert_eq!(
            relay.acknowledge(conn.id, ticket_id),
            Err(AckRejection::UnknownTicket)
        );
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 7)]
        );
        assert_eq!(relay.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_records_wait_for_a_connection() {
        let (relay, ledger) = relay(DeliveryMode::Push, RelayConfig::default(), false);
        relay.start().unwrap();

        offer(&relay, &ledger, 0, 1);
        offer(&relay, &ledger, 0, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.stats().pending, 2);

        let mut conn = relay.connect();
        assert_eq!(next_push(&mut conn).await.1.offset, 1);
        assert_eq!(next_push(&mut conn).await.1.offset, 2);
    }

    #[tokio::test]
    async fn test_disconnect_redispatches_to_other_connection() {
        let (relay, ledger) = relay(DeliveryMode::Push, config(2, Duration::from_secs(30)), false);
        relay.start().unwrap();
        let mut a = relay.connect();

        offer(&relay, &ledger, 0, 7);
        let (first_ticket, _) = next_push(&mut a).await;

        let mut b = relay.connect();
        relay.disconnect(a.id);

        let (ticket_id, record) = next_push(&mut b).await;
        assert_eq!(ticket_id, first_ticket);
        assert_eq!(record.offset, 7);

        assert_eq!(relay.acknowledge(b.id, ticket_id), Ok(()));
        assert!(relay.dead_letters().is_empty());
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 7)]
        );
    }

    #[tokio::test]
    async fn test_ack_from_another_connection_is_rejected() {
        let (relay, ledger) = relay(DeliveryMode::Push, RelayConfig::default(), false);
        relay.start().unwrap();
        let mut a = relay.connect();

        offer(&relay, &ledger, 0, 7);
        let (ticket_id, _) = next_push(&mut a).await;

        let b = relay.connect();
        assert_eq!(
            relay.acknowledge(b.id, ticket_id),
            Err(AckRejection::NotDeliveredTo(b.id))
        );
        assert!(ledger.take_commits().is_empty());
        assert_eq!(relay.stats().in_flight, 1);

        assert_eq!(relay.acknowledge(a.id, ticket_id), Ok(()));
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 7)]
        );
    }

    #[tokio::test]
    async fn test_pending_ticket_cannot_be_acknowledged() {
        let (relay, ledger) = relay(DeliveryMode::Pull, RelayConfig::default(), false);
        relay.start().unwrap();
        let conn = relay.connect();

        offer(&relay, &ledger, 0, 1);
        assert_eq!(
            relay.acknowledge(conn.id, TicketId(1)),
            Err(AckRejection::NotDeliveredTo(conn.id))
        );
        assert_eq!(relay.stats().pending, 1);
        assert!(ledger.take_commits().is_empty());

        let delivered = relay.pull(conn.id, 1);
        assert_eq!(delivered[0].ticket_id, TicketId(1));
        assert_eq!(relay.acknowledge(conn.id, TicketId(1)), Ok(()));
    }

    #[tokio::test]
    async fn test_full_connection_does_not_hold_up_others() {
        let config = RelayConfig {
            send_queue_capacity: 2,
            ..RelayConfig::default()
        };
        let (relay, ledger) = relay(DeliveryMode::Push, config, false);
        relay.start().unwrap();

        // Never read from
        let _stuck = relay.connect();
        let mut healthy = relay.connect();

        for offset in 0..10 {
            offer(&relay, &ledger, 0, offset);
        }

        let mut received = 0;
        while received < 8 {
            next_push(&mut healthy).await;
            received += 1;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while relay.stats().pending > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(relay.stats().pending, 0);
        assert_eq!(relay.stats().in_flight, 10);
    }

    #[tokio::test]
    async fn test_late_failure_of_previous_attempt_is_ignored() {
        let (relay, ledger) = relay(DeliveryMode::Push, config(2, Duration::from_secs(30)), false);
        relay.start().unwrap();
        let mut a = relay.connect();

        offer(&relay, &ledger, 0, 7);
        let (ticket_id, _) = next_push(&mut a).await;
        let mut b = relay.connect();
        relay.disconnect(a.id);
        next_push(&mut b).await;

        // A timer from the first attempt firing after the redelivery
        relay
            .inner
            .fail_delivery(ticket_id, 1, DeliveryFailure::AckTimeout(a.id, 30000));
        assert!(relay.dead_letters().is_empty());
        assert_eq!(relay.stats().pending, 0);

        assert_eq!(relay.acknowledge(b.id, ticket_id), Ok(()));
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 7)]
        );
    }

    #[tokio::test]
    async fn test_ack_timeout_exhaustion_dead_letters() {
        let (relay, ledger) = relay(DeliveryMode::Push, config(1, Duration::from_millis(50)), false);
        relay.start().unwrap();
        let mut conn = relay.connect();

        offer(&relay, &ledger, 0, 3);
        next_push(&mut conn).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let entries = relay.dead_letters().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.offset, 3);
        assert!(entries[0].failure_reason.contains("not acknowledged"));
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 3)]
        );
        assert_eq!(relay.view(entries[0].id).unwrap().value, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_pull_hands_out_pending_records() {
        let (relay, ledger) = relay(DeliveryMode::Pull, RelayConfig::default(), false);
        relay.start().unwrap();
        let conn = relay.connect();

        for offset in 0..5 {
            offer(&relay, &ledger, 0, offset);
        }

        let first = relay.pull(conn.id, 3);
        assert_eq!(first.iter().map(|d| d.record.offset).collect::<Vec<_>>(), vec![0, 1, 2]);
        let rest = relay.pull(conn.id, 10);
        assert_eq!(rest.len(), 2);
        assert!(relay.pull(conn.id, 10).is_empty());

        for delivery in first {
            relay.acknowledge(conn.id, delivery.ticket_id).unwrap();
        }
        assert_eq!(
            ledger.take_commits(),
            vec![OffsetCommit::new(Partition::new("events", 0), 2)]
        );
    }

    #[tokio::test]
    async fn test_orderly_pull_pins_partition_to_one_connection() {
        let (relay, ledger) = relay(DeliveryMode::Pull, RelayConfig::default(), true);
        relay.start().unwrap();
        let a = relay.connect();
        let b = relay.connect();

        offer(&relay, &ledger, 0, 1);
        offer(&relay, &ledger, 1, 1);
        offer(&relay, &ledger, 0, 2);

        let to_a = relay.pull(a.id, 1);
        assert_eq!(to_a[0].record.partition, 0);

        // Partition 0 is leased to a, so b only sees partition 1
        let to_b = relay.pull(b.id, 10);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].record.partition, 1);

        let more_a = relay.pull(a.id, 10);
        assert_eq!(more_a.len(), 1);
        assert_eq!(more_a[0].record.offset, 2);
    }

    #[tokio::test]
    async fn test_requeue_keeps_partition_offset_order() {
        let (relay, ledger) = relay(DeliveryMode::Pull, RelayConfig::default(), true);
        relay.start().unwrap();
        let a = relay.connect();

        for offset in 10..13 {
            offer(&relay, &ledger, 0, offset);
        }
        assert_eq!(relay.pull(a.id, 3).len(), 3);

        relay.disconnect(a.id);
        let b = relay.connect();
        let redelivered = relay.pull(b.id, 10);
        assert_eq!(
            redelivered.iter().map(|d| d.record.offset).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
    }

    #[tokio::test]
    async fn test_close_rejects_new_records() {
        let (relay, ledger) = relay(DeliveryMode::Push, RelayConfig::default(), false);
        relay.start().unwrap();
        let ConnectionHandle {
            mut frames,
            replies,
            ..
        } = relay.connect();
        drop(replies);

        relay.close();
        relay.close();
        assert!(relay.is_closed());
        assert_eq!(relay.stats().connections, 0);
        assert!(frames.recv().await.is_none());

        let record = Record::new("events", 0, 1, None, None, None);
        let ack = ledger.track(&record);
        assert!(relay.on_message(record, ack).is_err());
    }

    #[test]
    fn test_relay_config_validation() {
        assert!(RelayConfig::default().validate().is_ok());
        assert_eq!(
            config(0, Duration::from_secs(1)).validate(),
            Err(ConfigurationError::NonPositive("max_attempts"))
        );
        assert_eq!(
            config(1, Duration::ZERO).validate(),
            Err(ConfigurationError::NonPositive("ack_timeout"))
        );
    }
}
