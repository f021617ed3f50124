//! In-process coordination store.
//!
//! A [`MemoryEnsemble`] is one shared node tree. Each [`MemoryStore`] is a
//! session attached to it, seeing the tree through its own namespace. Session
//! loss can be simulated with [`MemoryStore::expire_session`] and
//! [`MemoryStore::reconnect`].

use crate::error::StoreError;
use crate::store::{ConnectionState, CoordinationStore, CreateMode, StoreEvent, WatchedEventType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type SessionId = u64;

#[derive(Debug)]
struct Node {
    ephemeral_owner: Option<SessionId>,
    data: Vec<u8>,
}

struct Session {
    namespace: String,
    events: mpsc::UnboundedSender<StoreEvent>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Absolute path -> sessions holding a one-shot children watch.
    child_watches: HashMap<String, HashSet<SessionId>>,
    sessions: HashMap<SessionId, Session>,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire_child_watches(&mut self, parent: &str) {
        let Some(watchers) = self.child_watches.remove(parent) else {
            return;
        };
        for id in watchers {
            if let Some(session) = self.sessions.get(&id) {
                let event = StoreEvent::Watched {
                    path: relative(&session.namespace, parent),
                    event_type: WatchedEventType::NodeChildrenChanged,
                };
                let _ = session.events.send(event);
            }
        }
    }

    /// Removes a session with every ephemeral node and watch it owns.
    fn end_session(&mut self, id: SessionId) {
        self.sessions.remove(&id);
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&id);
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire_child_watches(parent_of(&path));
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn relative(namespace: &str, absolute: &str) -> String {
    match absolute.strip_prefix(namespace) {
        Some("") => "/".to_string(),
        Some(rest) => rest.to_string(),
        None => absolute.to_string(),
    }
}

fn validate(path: &str) -> Result<(), StoreError> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// A shared in-process node tree.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unstarted session whose paths live under `/<namespace>`.
    /// An empty namespace addresses the tree root.
    pub fn connect(&self, namespace: &str) -> MemoryStore {
        let (tx, rx) = mpsc::unbounded_channel();
        let namespace = namespace.trim_matches('/');
        MemoryStore {
            ensemble: self.clone(),
            namespace: if namespace.is_empty() {
                String::new()
            } else {
                format!("/{}", namespace)
            },
            session: Mutex::new(None),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            operations: AtomicU64::new(0),
        }
    }

    /// Returns whether an absolute path exists.
    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().exists(path)
    }

    /// Children names of an absolute path, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree.lock().children(path)
    }

    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    fn open_session(&self, namespace: &str, events: mpsc::UnboundedSender<StoreEvent>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let mut tree = self.tree.lock();
        tree.sessions.insert(
            id,
            Session {
                namespace: namespace.to_string(),
                events,
            },
        );
        // The namespace root is created implicitly, with its ancestors.
        let mut path = String::new();
        for segment in namespace.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);
            tree.nodes
                .entry(path.clone())
                .or_insert(Node {
                    ephemeral_owner: None,
                    data: Vec::new(),
                });
        }
        id
    }

    fn end_session(&self, id: SessionId) {
        self.tree.lock().end_session(id);
    }
}

/// One session against a [`MemoryEnsemble`].
pub struct MemoryStore {
    ensemble: MemoryEnsemble,
    namespace: String,
    session: Mutex<Option<SessionId>>,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,
    closed: AtomicBool,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of operations issued against the tree by this store.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Drops the current session as the server would on expiry: its
    /// ephemeral nodes and watches vanish and `Lost` is reported.
    pub fn expire_session(&self) {
        if let Some(id) = self.session.lock().take() {
            self.ensemble.end_session(id);
            tracing::debug!(session = id, "Memory store session expired");
            self.emit(StoreEvent::StateChanged(ConnectionState::Lost));
        }
    }

    /// Opens a fresh session after [`expire_session`](Self::expire_session)
    /// and reports `Reconnected`.
    pub fn reconnect(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut session = self.session.lock();
        if session.is_none() {
            let id = self.ensemble.open_session(&self.namespace, self.events_tx.clone());
            *session = Some(id);
            tracing::debug!(session = id, "Memory store session reconnected");
            self.emit(StoreEvent::StateChanged(ConnectionState::Reconnected));
        }
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events_tx.send(event);
    }

    fn absolute(&self, path: &str) -> Result<String, StoreError> {
        validate(path)?;
        if path == "/" {
            return Ok(if self.namespace.is_empty() {
                "/".to_string()
            } else {
                self.namespace.clone()
            });
        }
        Ok(format!("{}{}", self.namespace, path))
    }

    /// Returns the live session id, counting the operation.
    fn session(&self) -> Result<SessionId, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        (*self.session.lock()).ok_or(StoreError::ConnectionLoss)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn start(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut session = self.session.lock();
        if session.is_none() {
            let id = self.ensemble.open_session(&self.namespace, self.events_tx.clone());
            *session = Some(id);
            tracing::debug!(session = id, namespace = %self.namespace, "Memory store session opened");
            self.emit(StoreEvent::StateChanged(ConnectionState::Connected));
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), StoreError> {
        let session = self.session()?;
        let absolute = self.absolute(path)?;
        let mut tree = self.ensemble.tree.lock();
        if tree.exists(&absolute) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let parent = parent_of(&absolute).to_string();
        if !tree.exists(&parent) {
            return Err(StoreError::NoNode(relative(&self.namespace, &parent)));
        }
        let ephemeral_owner = match mode {
            CreateMode::Ephemeral => Some(session),
            CreateMode::Persistent => None,
        };
        tree.nodes.insert(
            absolute,
            Node {
                ephemeral_owner,
                data: data.to_vec(),
            },
        );
        tree.fire_child_watches(&parent);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.session()?;
        let absolute = self.absolute(path)?;
        let mut tree = self.ensemble.tree.lock();
        if !tree.nodes.contains_key(&absolute) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !tree.children(&absolute).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(&absolute);
        tree.fire_child_watches(parent_of(&absolute));
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.session()?;
        let absolute = self.absolute(path)?;
        let tree = self.ensemble.tree.lock();
        match tree.nodes.get(&absolute) {
            Some(node) => Ok(node.data.clone()),
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn request_children(&self, path: &str) -> Result<(), StoreError> {
        let session = self.session()?;
        let absolute = self.absolute(path)?;
        let mut tree = self.ensemble.tree.lock();
        if !tree.exists(&absolute) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = tree.children(&absolute);
        tree.child_watches
            .entry(absolute)
            .or_default()
            .insert(session);
        self.emit(StoreEvent::Children {
            path: path.to_string(),
            children,
        });
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.session.lock().take() {
            self.ensemble.end_session(id);
            tracing::debug!(session = id, "Memory store session closed");
        }
    }
}
