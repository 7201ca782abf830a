//! Channel endpoints.
//!
//! The sandbox side is a plain blocking queue for its event loop. The host
//! side is broadcast-style: a dispatcher thread decodes every inbound
//! message and offers it to all installed listeners. Each listener is
//! one-shot; it resolves on the first matching message that arrives after
//! it was installed and is then removed.

use crate::message::{Command, Message, Seq};
use crate::wire::{decode, encode, Direction, Envelope};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Peer disconnected")]
    Disconnected,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message references missing transfer entry {0}")]
    MissingTransfer(usize),
}

/// Create a connected host/sandbox pair.
pub fn channel() -> (HostPort, SandboxPort) {
    let (to_sandbox_tx, to_sandbox_rx) = unbounded();
    let (to_host_tx, to_host_rx) = unbounded();
    let host = HostPort::new(to_sandbox_tx, to_host_rx);
    let sandbox = SandboxPort {
        rx: to_sandbox_rx,
        tx: to_host_tx,
    };
    (host, sandbox)
}

/// Sandbox-side endpoint.
pub struct SandboxPort {
    rx: Receiver<Envelope>,
    tx: Sender<Envelope>,
}

impl SandboxPort {
    /// Block until the next message.
    ///
    /// `Ok(None)` means the message carried an unknown command.
    pub fn recv(&self) -> Result<Option<Message>, ChannelError> {
        let envelope = self.rx.recv().map_err(|_| ChannelError::Disconnected)?;
        decode(envelope, Direction::ToSandbox)
    }

    /// Like [`recv`](Self::recv), giving up after `timeout` with `Ok(None)`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => decode(envelope, Direction::ToSandbox),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.post(encode(message)?)
    }

    /// Post a raw envelope, e.g. one carrying a command this crate does not know.
    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx.send(envelope).map_err(|_| ChannelError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy)]
struct Filter {
    command: Command,
    seq: Option<Seq>,
}

impl Filter {
    fn matches(&self, message: &Message) -> bool {
        message.command() == self.command
            && self.seq.is_none_or(|seq| message.seq() == Some(seq))
    }
}

struct Entry {
    id: u64,
    filter: Filter,
    tx: oneshot::Sender<Message>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<Entry>,
    closed: bool,
}

#[derive(Default)]
struct Listeners {
    table: Mutex<ListenerTable>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, ListenerTable> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn install(self: &Arc<Self>, filter: Filter) -> Listener {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        // Once closed the sender is dropped here and the listener fails.
        if !table.closed {
            table.entries.push(Entry { id, filter, tx });
        }
        Listener {
            id,
            filter,
            rx,
            listeners: self.clone(),
        }
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|entry| entry.id != id);
    }

    /// Offer a message to every matching listener. Returns how many took it.
    fn dispatch(&self, message: Message) -> usize {
        let mut table = self.lock();
        let (matched, rest): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut table.entries)
            .into_iter()
            .partition(|entry| entry.filter.matches(&message));
        table.entries = rest;
        drop(table);

        let mut delivered = 0;
        let mut original = Some(message);
        let count = matched.len();
        for (i, entry) in matched.into_iter().enumerate() {
            let copy = if i + 1 == count {
                original.take()
            } else {
                original.as_ref().and_then(Message::duplicate)
            };
            if let Some(copy) = copy {
                if entry.tx.send(copy).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn close(&self) {
        let mut table = self.lock();
        table.closed = true;
        table.entries.clear();
    }
}

/// A pending one-shot listen.
///
/// Dropping it detaches the listener without consuming anything.
pub struct Listener {
    id: u64,
    filter: Filter,
    rx: oneshot::Receiver<Message>,
    listeners: Arc<Listeners>,
}

impl Listener {
    pub fn command(&self) -> Command {
        self.filter.command
    }

    /// Wait for the matching message.
    pub async fn recv(mut self) -> Result<Message, ChannelError> {
        (&mut self.rx).await.map_err(|_| ChannelError::Disconnected)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.listeners.remove(self.id);
    }
}

/// Host-side endpoint.
pub struct HostPort {
    tx: Sender<Envelope>,
    listeners: Arc<Listeners>,
    /// Dispatcher thread; exits when the sandbox side disconnects
    _dispatcher: Option<JoinHandle<()>>,
}

impl HostPort {
    fn new(tx: Sender<Envelope>, rx: Receiver<Envelope>) -> Self {
        let listeners = Arc::new(Listeners::default());
        let inbox = listeners.clone();
        let dispatcher = thread::Builder::new()
            .name("host-inbox".to_string())
            .spawn(move || run_dispatcher(rx, &inbox));
        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Without a dispatcher nothing can ever be received.
                warn!("Failed to spawn host inbox thread: {}", e);
                listeners.close();
                None
            }
        };
        Self {
            tx,
            listeners,
            _dispatcher: dispatcher,
        }
    }

    /// Post a message to the sandbox; transferables move with it.
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        let command = message.command();
        let envelope = encode(message)?;
        trace!("host -> sandbox {}: {}", command, envelope.data);
        self.tx.send(envelope).map_err(|_| ChannelError::Disconnected)
    }

    /// Install a one-shot listener for the next `command`.
    pub fn listen(&self, command: Command) -> Listener {
        self.listeners.install(Filter { command, seq: None })
    }

    /// Install a one-shot listener for `command` carrying `seq`.
    pub fn listen_for(&self, command: Command, seq: Seq) -> Listener {
        self.listeners.install(Filter {
            command,
            seq: Some(seq),
        })
    }
}

fn run_dispatcher(rx: Receiver<Envelope>, listeners: &Listeners) {
    debug!("Host inbox started");
    while let Ok(envelope) = rx.recv() {
        let data = envelope.data.clone();
        match decode(envelope, Direction::ToHost) {
            Ok(Some(message)) => {
                let command = message.command();
                let delivered = listeners.dispatch(message);
                trace!("sandbox -> host {} delivered to {} listener(s)", command, delivered);
                if delivered == 0 {
                    debug!("No listener for {}, dropped", data);
                }
            }
            Ok(None) => debug!("Ignoring unknown message {}", data),
            Err(e) => warn!("Dropping malformed message from sandbox: {}", e),
        }
    }
    listeners.close();
    debug!("Host inbox closed (sandbox disconnected)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_resolves_on_next_match() {
        let (host, sandbox) = channel();
        let ack = host.listen(Command::InitAck);
        sandbox.send(Message::InitAck).unwrap();
        assert!(matches!(ack.recv().await.unwrap(), Message::InitAck));
    }

    #[tokio::test]
    async fn test_listener_matches_by_seq() {
        let (host, sandbox) = channel();
        let ack = host.listen_for(Command::RenderAck, Seq(2));
        sandbox.send(Message::RenderAck { seq: Seq(1) }).unwrap();
        sandbox.send(Message::RenderAck { seq: Seq(2) }).unwrap();
        assert!(matches!(ack.recv().await.unwrap(), Message::RenderAck { seq: Seq(2) }));
    }

    #[tokio::test]
    async fn test_broadcast_to_all_matching_listeners() {
        let (host, sandbox) = channel();
        let first = host.listen(Command::RenderAck);
        let second = host.listen(Command::RenderAck);
        sandbox.send(Message::RenderAck { seq: Seq(5) }).unwrap();
        assert!(matches!(first.recv().await.unwrap(), Message::RenderAck { seq: Seq(5) }));
        assert!(matches!(second.recv().await.unwrap(), Message::RenderAck { seq: Seq(5) }));
    }

    #[tokio::test]
    async fn test_listener_is_one_shot() {
        let (host, sandbox) = channel();
        let ack = host.listen(Command::InitAck);
        sandbox.send(Message::InitAck).unwrap();
        ack.recv().await.unwrap();

        // A second ack without a freshly installed listener is dropped.
        // Dispatch is in order, so once the marker arrives the ack is gone.
        let marker = host.listen(Command::RenderAck);
        sandbox.send(Message::InitAck).unwrap();
        sandbox.send(Message::RenderAck { seq: Seq(1) }).unwrap();
        marker.recv().await.unwrap();

        let late = host.listen(Command::InitAck);
        let waited = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fails_listeners() {
        let (host, sandbox) = channel();
        let pending = host.listen(Command::RenderAck);
        drop(sandbox);
        assert!(matches!(pending.recv().await, Err(ChannelError::Disconnected)));

        let after = host.listen(Command::RenderAck);
        assert!(matches!(after.recv().await, Err(ChannelError::Disconnected)));
        assert!(matches!(host.send(Message::InitAck), Err(ChannelError::Disconnected)));
    }

    #[test]
    fn test_sandbox_recv_and_unknown() {
        let (host, sandbox) = channel();
        host.send(Message::Render { time: 1.0, seq: Seq(1) }).unwrap();
        host.tx
            .send(Envelope {
                data: r#"{"command":"bogus"}"#.to_string(),
                transfer: Vec::new(),
            })
            .unwrap();

        assert!(matches!(sandbox.recv().unwrap(), Some(Message::Render { seq: Seq(1), .. })));
        assert!(sandbox.recv().unwrap().is_none());
        assert!(sandbox.recv_timeout(Duration::from_millis(10)).unwrap().is_none());

        drop(host);
        assert!(matches!(sandbox.recv(), Err(ChannelError::Disconnected)));
    }
}
