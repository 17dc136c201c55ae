use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use prometheus::IntCounter;
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tracing::{debug, error, instrument};
use tungstenite::Message;
use uuid::Uuid;

use crate::{server::message, utils::error::CloseReason};

/// Sliding inactivity deadline owned by one connection.
#[derive(Debug, Default)]
struct InactivityTimer {
    /// `(ttl, deadline)`; `None` until the limiter arms it.
    state: Mutex<Option<(Duration, Instant)>>,
    changed: Notify,
}

impl InactivityTimer {
    fn arm(&self, ttl: Duration) {
        *self.state.lock() = Some((ttl, Instant::now() + ttl));
        self.changed.notify_waiters();
    }

    fn touch(&self) {
        let mut state = self.state.lock();
        if let Some((ttl, deadline)) = state.as_mut() {
            *deadline = Instant::now() + *ttl;
        }
    }

    fn deadline(&self) -> Option<Instant> {
        (*self.state.lock()).map(|(_, deadline)| deadline)
    }

    fn ttl(&self) -> Option<Duration> {
        (*self.state.lock()).map(|(ttl, _)| ttl)
    }
}

/// One accepted WebSocket connection.
///
/// Outbound frames go through an unbounded channel drained by a writer task,
/// so sending never blocks the caller.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for the connection.
    pub id: Uuid,
    /// Socket address of the client.
    pub addr: SocketAddr,
    pub created_at: Instant,
    subscriptions: AtomicUsize,
    sender: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    close_signal: Notify,
    ttl: InactivityTimer,
    watchdog_started: AtomicBool,
}

impl Connection {
    /// Creates a connection whose outbound frames are delivered to `sender`.
    pub fn new(addr: SocketAddr, sender: mpsc::UnboundedSender<Message>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            created_at: Instant::now(),
            subscriptions: AtomicUsize::new(0),
            sender,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            ttl: InactivityTimer::default(),
            watchdog_started: AtomicBool::new(false),
        })
    }

    /// Creates a connection and spawns the task that writes its frames to `writer`.
    ///
    /// The writer stops after forwarding a close frame or on the first write error.
    #[instrument(skip(writer, messages_sent))]
    pub fn with_writer<W>(addr: SocketAddr, writer: W, messages_sent: IntCounter) -> Arc<Self>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: std::fmt::Display,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let connection = Self::new(addr, sender);

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = receiver.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = writer.send(msg).await {
                    debug!("Failed to send message to {}: {}", addr, e);
                    break;
                }
                messages_sent.inc();
                if is_close {
                    break;
                }
            }
        });

        connection
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Queues a response or event frame and slides the inactivity deadline.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` once the connection has been closed and
    /// `ClientError::SendFailed` if the writer task is gone.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        self.send_untracked(message)?;
        self.ttl.touch();
        Ok(())
    }

    /// Queues a frame without counting it as activity (keep-alive pings).
    pub fn send_untracked(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.sender.send(message).map_err(|e| {
            error!("Failed to queue message: {}", e);
            ClientError::SendFailed
        })
    }

    /// Sends the coded error frame and close frame for `reason`.
    ///
    /// Returns `false` if the connection was already closed, in which case
    /// nothing is sent.
    pub fn close_with(&self, reason: &CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match message::create_close_error_message(reason) {
            Ok(frame) => {
                let _ = self.sender.send(frame);
            }
            Err(e) => error!("Failed to encode close reason: {}", e),
        }
        let _ = self.sender.send(message::create_close_frame(reason));
        self.close_signal.notify_waiters();
        true
    }

    /// Closes the connection with a normal close frame.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Message::Close(None));
        self.close_signal.notify_waiters();
    }

    /// Marks the connection closed after the peer went away.
    pub fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed from either side.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Acquire)
    }

    pub(crate) fn reset_subscriptions(&self) {
        self.subscriptions.store(0, Ordering::Release);
    }

    pub(crate) fn add_subscriptions(&self, amount: usize) {
        self.subscriptions.fetch_add(amount, Ordering::AcqRel);
    }

    pub(crate) fn remove_subscriptions(&self, amount: usize) {
        let _ = self
            .subscriptions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(amount))
            });
    }

    /// Arms (or re-arms) the inactivity deadline with a new TTL.
    pub(crate) fn arm_inactivity_timer(&self, ttl: Duration) {
        self.ttl.arm(ttl);
    }

    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.ttl.deadline()
    }

    pub fn inactivity_ttl(&self) -> Option<Duration> {
        self.ttl.ttl()
    }

    /// Claims the right to run this connection's TTL watchdog. Only the first call wins.
    pub(crate) fn claim_watchdog(&self) -> bool {
        !self.watchdog_started.swap(true, Ordering::AcqRel)
    }

    /// Waits until the inactivity deadline passes without being pushed out.
    ///
    /// Returns `false` if the connection closes first.
    pub(crate) async fn idle_expired(&self) -> bool {
        loop {
            let rearmed = self.ttl.changed.notified();
            let deadline = match self.ttl.deadline() {
                Some(deadline) => deadline,
                None => {
                    tokio::select! {
                        _ = rearmed => {}
                        _ = self.closed() => return false,
                    }
                    continue;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.closed() => return false,
            }

            match self.ttl.deadline() {
                Some(current) if current <= Instant::now() => return true,
                _ => continue,
            }
        }
    }
}

/// Tracks every live connection so they can be closed on shutdown.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id, connection);
    }

    pub fn remove(&self, id: &Uuid) {
        self.connections.remove(id);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every connection; used on shutdown.
    pub fn close_all(&self) {
        self.connections.iter().for_each(|entry| {
            debug!("Closing connection {}", entry.key());
            entry.value().close();
        });
    }
}

/// Represents errors that may occur in connection operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message")]
    SendFailed,
    #[error("Connection already closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("127.0.0.1:4000".parse().unwrap(), tx), rx)
    }

    #[tokio::test]
    async fn close_with_sends_error_then_close_frame_once() {
        let (conn, mut rx) = connection();
        assert!(conn.close_with(&CloseReason::TtlExpired { ttl_ms: 5 }));
        assert!(!conn.close_with(&CloseReason::TtlExpired { ttl_ms: 5 }));

        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
        assert!(matches!(rx.recv().await, Some(Message::Close(Some(_)))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sending_after_close_fails() {
        let (conn, _rx) = connection();
        conn.close();
        assert!(matches!(
            conn.send(Message::Text("x".into())),
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn subscription_counter_saturates_at_zero() {
        let (conn, _rx) = connection();
        conn.add_subscriptions(2);
        conn.remove_subscriptions(5);
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_slide_the_deadline_but_pings_do_not() {
        let (conn, _rx) = connection();
        conn.arm_inactivity_timer(Duration::from_secs(10));
        let first = conn.inactivity_deadline().unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        conn.send_untracked(Message::Text("ping".into())).unwrap();
        assert_eq!(conn.inactivity_deadline(), Some(first));

        conn.send(Message::Text("response".into())).unwrap();
        assert_eq!(conn.inactivity_deadline(), Some(first + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expired_returns_false_when_closed_first() {
        let (conn, _rx) = connection();
        conn.arm_inactivity_timer(Duration::from_secs(10));
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.idle_expired().await })
        };
        tokio::time::advance(Duration::from_secs(1)).await;
        conn.mark_closed();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn manager_closes_everything() {
        let manager = ConnectionManager::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        manager.add(a.clone());
        manager.add(b.clone());
        manager.close_all();
        assert!(a.is_closed() && b.is_closed());
        manager.remove(&a.id);
        assert_eq!(manager.len(), 1);
    }
}
