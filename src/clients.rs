//! Registry of open page contexts ("clients") the coordinator can reach.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{CoordinatorMessage, PageMessage};

pub type ClientId = u64;

#[derive(Default)]
struct Inner {
  next_id: ClientId,
  clients: BTreeMap<ClientId, mpsc::UnboundedSender<CoordinatorMessage>>,
}

/// Shared list of live clients plus the general page -> worker channel.
#[derive(Clone)]
pub struct ClientRegistry {
  inner: Arc<Mutex<Inner>>,
  to_worker: mpsc::UnboundedSender<(ClientId, PageMessage)>,
}

impl ClientRegistry {
  /// Create a registry and the receiver for messages pages post to the worker.
  pub fn new() -> (Self, mpsc::UnboundedReceiver<(ClientId, PageMessage)>) {
    let (to_worker, rx) = mpsc::unbounded_channel();
    let registry = Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      to_worker,
    };
    (registry, rx)
  }

  /// Register a new page context. It stays discoverable until the
  /// returned connection is dropped.
  pub fn connect(&self) -> ClientConnection {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = {
      let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      let id = inner.next_id;
      inner.next_id += 1;
      inner.clients.insert(id, tx);
      id
    };
    debug!(client = id, "Client connected");

    ClientConnection {
      id,
      rx,
      registry: self.clone(),
    }
  }

  /// Pick one live client, the longest-connected one.
  pub fn discover(&self) -> Option<Client> {
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.clients.retain(|_, tx| !tx.is_closed());
    inner
      .clients
      .iter()
      .next()
      .map(|(id, tx)| Client {
        id: *id,
        tx: tx.clone(),
      })
  }

  pub fn len(&self) -> usize {
    let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.clients.values().filter(|tx| !tx.is_closed()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn disconnect(&self, id: ClientId) {
    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    if inner.clients.remove(&id).is_some() {
      debug!(client = id, "Client disconnected");
    }
  }
}

/// Coordinator-side handle to one client.
#[derive(Clone)]
pub struct Client {
  pub id: ClientId,
  tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl Client {
  /// Returns false when the client went away in the meantime.
  pub fn post(&self, message: CoordinatorMessage) -> bool {
    self.tx.send(message).is_ok()
  }
}

/// Page-side end of a registration.
pub struct ClientConnection {
  id: ClientId,
  rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
  registry: ClientRegistry,
}

impl ClientConnection {
  pub fn id(&self) -> ClientId {
    self.id
  }

  pub async fn recv(&mut self) -> Option<CoordinatorMessage> {
    self.rx.recv().await
  }

  /// Post a message to the worker's general channel.
  pub fn post_to_worker(&self, message: PageMessage) -> bool {
    self.registry.to_worker.send((self.id, message)).is_ok()
  }
}

impl Drop for ClientConnection {
  fn drop(&mut self) {
    self.registry.disconnect(self.id);
  }
}
