//! Runs the distributed tree: dials parents, keeps child connections, and carries out the
//! `TreeAction`s the core state machine returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slsk_core::server::ParentCandidate;
use slsk_core::wire::DecodeError;
use slsk_core::{ConnectionType, DistributedMessage, DistributedTree, Event, TreeAction};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{PeerConnection, PeerIdentity};
use crate::search::LocalSearch;
use crate::server::ServerHandle;

struct ParentLink {
    username: String,
    generation: u64,
    task: JoinHandle<()>,
}

/// The running candidate walk, tagged so a superseded walk can tell it lost.
struct Acquisition {
    attempt: u64,
    task: JoinHandle<()>,
}

struct ChildLink {
    generation: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Snapshot used to turn tree changes into events.
#[derive(PartialEq)]
struct Shape {
    parent: Option<String>,
    branch: Option<(u32, String)>,
    children: usize,
}

impl Shape {
    fn of(tree: &DistributedTree) -> Self {
        Self {
            parent: tree.parent().map(str::to_owned),
            branch: tree.branch_level().zip(tree.branch_root().map(str::to_owned)),
            children: tree.children().count(),
        }
    }
}

pub struct DistributedNetwork {
    own_username: String,
    tree: Mutex<DistributedTree>,
    server: ServerHandle,
    search: Arc<LocalSearch>,
    events: mpsc::Sender<Event>,
    connect_timeout: Duration,
    parent: Mutex<Option<ParentLink>>,
    acquiring: Mutex<Option<Acquisition>>,
    children: Mutex<HashMap<String, ChildLink>>,
    generation: AtomicU64,
}

impl DistributedNetwork {
    pub fn new(
        tree: DistributedTree,
        server: ServerHandle,
        search: Arc<LocalSearch>,
        events: mpsc::Sender<Event>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_username: tree.own_username().to_owned(),
            tree: Mutex::new(tree),
            server,
            search,
            events,
            connect_timeout,
            parent: Mutex::new(None),
            acquiring: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn parent(&self) -> Option<String> {
        self.tree.lock().parent().map(str::to_owned)
    }

    pub fn branch(&self) -> (Option<u32>, Option<String>) {
        let tree = self.tree.lock();
        (tree.branch_level(), tree.branch_root().map(str::to_owned))
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    pub fn on_possible_parents(self: &Arc<Self>, candidates: &[ParentCandidate]) {
        self.update(|tree| Ok(tree.on_possible_parents(candidates)));
    }

    pub fn on_reset(self: &Arc<Self>) {
        info!("server reset our distributed position");
        self.cancel_acquisition();
        let children: Vec<String> = self.children.lock().keys().cloned().collect();
        for child in children {
            self.drop_child(&child);
            self.update(|tree| Ok(tree.on_child_disconnected(&child)));
        }
        self.update(|tree| Ok(tree.on_reset()));
    }

    pub fn on_embedded_message(self: &Arc<Self>, code: u8, payload: &[u8]) {
        self.update(|tree| tree.on_embedded_message(code, payload));
    }

    /// Take a child that opened a `D` connection to us.
    pub fn add_child(self: &Arc<Self>, mut conn: PeerConnection) {
        let username = conn.username().to_owned();
        let generation = self.next_generation();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let net = Arc::clone(self);
        let name = username.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = conn.send(frame).await {
                            debug!(child = %name, error = %e, "child write failed");
                            break;
                        }
                    }
                    frame = conn.recv() => match frame {
                        Ok(Some(frame)) => match DistributedMessage::parse(frame.code, &frame.payload) {
                            Ok(DistributedMessage::ChildDepth(depth)) => {
                                net.update(|tree| Ok(tree.on_child_depth(depth)));
                            }
                            Ok(other) => trace!(child = %name, code = other.code() as u8, "ignoring child message"),
                            Err(e) => debug!(child = %name, error = %e, "malformed child message"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            debug!(child = %name, error = %e, "child read failed");
                            break;
                        }
                    },
                }
            }
            net.child_finished(&name, generation);
        });
        let previous = self.children.lock().insert(
            username.clone(),
            ChildLink {
                generation,
                tx,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        self.update(|tree| Ok(tree.on_child_connected(&username)));
    }

    fn child_finished(self: &Arc<Self>, username: &str, generation: u64) {
        let removed = {
            let mut children = self.children.lock();
            match children.get(username) {
                Some(link) if link.generation == generation => children.remove(username).is_some(),
                _ => false,
            }
        };
        if removed {
            debug!(child = username, "child left");
            self.update(|tree| Ok(tree.on_child_disconnected(username)));
        }
    }

    fn cancel_acquisition(&self) {
        if let Some(acquisition) = self.acquiring.lock().take() {
            acquisition.task.abort();
            debug!(attempt = acquisition.attempt, "parent acquisition cancelled");
        }
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        self.acquiring
            .lock()
            .as_ref()
            .is_some_and(|a| a.attempt == attempt)
    }

    fn drop_child(&self, username: &str) {
        if let Some(link) = self.children.lock().remove(username) {
            link.task.abort();
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a tree transition, report what changed, then carry out its actions.
    fn update<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&mut DistributedTree) -> Result<Vec<TreeAction>, DecodeError>,
    {
        let (before, after, result) = {
            let mut tree = self.tree.lock();
            let before = Shape::of(&tree);
            let result = f(&mut tree);
            (before, Shape::of(&tree), result)
        };
        if before != after {
            self.report(&before, after);
        }
        match result {
            Ok(actions) => self.execute(actions),
            Err(e) => debug!(error = %e, "malformed distributed message"),
        }
    }

    fn report(&self, before: &Shape, after: Shape) {
        if before.parent != after.parent {
            self.emit(Event::DistributedParentChanged {
                parent: after.parent,
            });
        }
        if before.branch != after.branch {
            if let Some((level, root)) = after.branch {
                self.emit(Event::DistributedBranch { level, root });
            }
        }
        if before.children != after.children {
            self.emit(Event::DistributedChildrenChanged {
                count: after.children,
            });
        }
    }

    fn emit(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            debug!("event channel full or closed; dropping distributed event");
        }
    }

    fn execute(self: &Arc<Self>, actions: Vec<TreeAction>) {
        for action in actions {
            match action {
                TreeAction::SendToServer(request) => {
                    if let Err(e) = self.server.send(request) {
                        debug!(error = %e, "server gone; dropping distributed update");
                    }
                }
                TreeAction::SendToChildren(msg) => self.send_to_children(&msg),
                TreeAction::SendToChild(username, msg) => self.send_to_child(&username, &msg),
                TreeAction::ConnectParents(candidates) => {
                    let attempt = self.next_generation();
                    let net = Arc::clone(self);
                    let mut slot = self.acquiring.lock();
                    let task = tokio::spawn(async move { net.connect_parents(attempt, candidates).await });
                    if let Some(previous) = slot.replace(Acquisition { attempt, task }) {
                        previous.task.abort();
                    }
                }
                TreeAction::DisconnectParent(username) => {
                    let mut slot = self.parent.lock();
                    if slot.as_ref().is_some_and(|p| p.username == username) {
                        if let Some(link) = slot.take() {
                            link.task.abort();
                            debug!(parent = %username, "parent dropped");
                        }
                    }
                }
                TreeAction::DisconnectChild(username) => self.drop_child(&username),
                TreeAction::LocalSearch {
                    username,
                    token,
                    query,
                } => self.search.answer(username, token, &query),
            }
        }
    }

    fn send_to_children(&self, msg: &DistributedMessage) {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode distributed message");
                return;
            }
        };
        for (name, link) in self.children.lock().iter() {
            if link.tx.send(frame.clone()).is_err() {
                trace!(child = %name, "child writer gone");
            }
        }
    }

    fn send_to_child(&self, username: &str, msg: &DistributedMessage) {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode distributed message");
                return;
            }
        };
        if let Some(link) = self.children.lock().get(username) {
            let _ = link.tx.send(frame);
        }
    }

    /// Try candidates in order; the first one that accepts becomes our parent.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    async fn connect_parents(self: Arc<Self>, attempt: u64, candidates: Vec<ParentCandidate>) {
        for candidate in candidates {
            let addr = SocketAddr::from((candidate.ip, candidate.port));
            let identity = PeerIdentity::new(
                candidate.username.clone(),
                ConnectionType::Distributed,
                rand::random(),
            );
            match PeerConnection::connect_direct(addr, &self.own_username, identity, self.connect_timeout)
                .await
            {
                Ok(conn) => {
                    info!(parent = %candidate.username, %addr, "connected to parent");
                    self.adopt_parent(attempt, conn);
                    return;
                }
                Err(e) => debug!(parent = %candidate.username, %addr, error = %e, "parent candidate failed"),
            }
        }
        self.update(|tree| {
            if !self.is_current_attempt(attempt) {
                return Ok(Vec::new());
            }
            Ok(tree.on_parent_attempts_failed())
        });
    }

    /// Install `conn` as the parent link, but only if the tree takes it. The link is put in place
    /// under the tree lock so the tree's parent and the live link never disagree.
    fn adopt_parent(self: &Arc<Self>, attempt: u64, conn: PeerConnection) {
        let username = conn.username().to_owned();
        self.update(|tree| {
            if !self.is_current_attempt(attempt) {
                debug!(parent = %username, "parent acquisition superseded; closing");
                return Ok(Vec::new());
            }
            let actions = tree.on_parent_connected(&username);
            if tree.parent() != Some(username.as_str()) {
                debug!(parent = %username, "parent connection refused by tree; closing");
                return Ok(Vec::new());
            }
            let link = self.spawn_parent_link(conn);
            if let Some(previous) = self.parent.lock().replace(link) {
                previous.task.abort();
            }
            Ok(actions)
        });
    }

    fn spawn_parent_link(self: &Arc<Self>, mut conn: PeerConnection) -> ParentLink {
        let username = conn.username().to_owned();
        let generation = self.next_generation();
        let net = Arc::clone(self);
        let name = username.clone();
        let task = tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Ok(Some(frame)) => match DistributedMessage::parse(frame.code, &frame.payload) {
                        Ok(msg) => net.update(|tree| tree.on_parent_message(msg)),
                        Err(e) => debug!(parent = %name, error = %e, "malformed parent message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!(parent = %name, error = %e, "parent read failed");
                        break;
                    }
                }
            }
            net.parent_finished(&name, generation);
        });
        ParentLink {
            username,
            generation,
            task,
        }
    }

    fn parent_finished(self: &Arc<Self>, username: &str, generation: u64) {
        let ours = {
            let mut slot = self.parent.lock();
            if slot.as_ref().is_some_and(|p| p.generation == generation) {
                slot.take();
                true
            } else {
                false
            }
        };
        if ours {
            info!(parent = username, "lost parent");
            self.update(|tree| Ok(tree.on_parent_disconnected(username)));
        }
    }
}
