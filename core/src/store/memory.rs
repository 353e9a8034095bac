/// In-memory content store
///
/// A shared node tree guarded by a `parking_lot::RwLock`, with sessions that
/// work on a private copy and replay their changes on `save()`. Saves are
/// optimistic: every node a session modified must still carry the revision
/// the session started from, otherwise the save fails with `Conflict` and
/// nothing is applied. Adding, moving or removing a variant or request also
/// moves the revision of its handle.
///
/// Locks live in a separate table and take effect immediately.
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::errors::{StoreError, StoreResult};
use crate::model::{DocumentVariant, PublicationRequest};
use crate::store::{ContentHandle, Lease, LockManager, Version};

/// Node type of intermediate folders
pub const NT_FOLDER: &str = "docflow:folder";
/// Node type of document handles
pub const NT_HANDLE: &str = "docflow:handle";
/// Node type of document variants
pub const NT_VARIANT: &str = "docflow:variant";
/// Node type of publication requests
pub const NT_REQUEST: &str = "docflow:request";

const EVENT_CAPACITY: usize = 256;

/// Variants and requests may share a name with their siblings; everything
/// else is unique within its parent.
fn allows_same_name_siblings(node_type: &str) -> bool {
    node_type == NT_VARIANT || node_type == NT_REQUEST
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StoreError::InvalidPath(format!("invalid node name '{}'", name)));
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

// ============================================================================
// TREE
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    id: Uuid,
    name: String,
    node_type: String,
    parent: Option<Uuid>,
    children: Vec<Uuid>,
    properties: Map<String, Value>,
    revision: u64,
    versions: Vec<Version>,
}

#[derive(Debug, Clone)]
struct Tree {
    root: Uuid,
    nodes: HashMap<Uuid, Node>,
}

impl Tree {
    fn new() -> Self {
        let root = Uuid::new_v4();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                name: String::new(),
                node_type: NT_FOLDER.to_string(),
                parent: None,
                children: Vec::new(),
                properties: Map::new(),
                revision: 1,
                versions: Vec::new(),
            },
        );
        Self { root, nodes }
    }

    fn get(&self, id: Uuid) -> StoreResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: Uuid) -> StoreResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn resolve(&self, path: &str) -> StoreResult<Uuid> {
        if !path.starts_with('/') {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut current = self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self
                .child_named(current, segment)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    fn path_of(&self, id: Uuid) -> String {
        let mut segments = Vec::new();
        let mut cursor = self.nodes.get(&id);
        while let Some(node) = cursor {
            if node.parent.is_none() {
                break;
            }
            segments.push(node.name.as_str());
            cursor = node.parent.and_then(|p| self.nodes.get(&p));
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    fn child_named(&self, parent: Uuid, name: &str) -> Option<Uuid> {
        self.nodes.get(&parent).and_then(|p| {
            p.children
                .iter()
                .copied()
                .find(|c| self.nodes.get(c).map(|n| n.name == name).unwrap_or(false))
        })
    }

    fn ensure_unique(&self, parent: Uuid, name: &str, node_type: &str, moving: Option<Uuid>) -> StoreResult<()> {
        if allows_same_name_siblings(node_type) {
            return Ok(());
        }
        match self.child_named(parent, name) {
            Some(existing) if Some(existing) != moving => Err(StoreError::ItemExists(join_path(
                &self.path_of(parent),
                name,
            ))),
            _ => Ok(()),
        }
    }

    /// Node whose revision covers the membership of `id` among its siblings.
    /// Only set for nodes that may share a name, whose parent gets no
    /// uniqueness check at apply time.
    fn membership_guard(&self, id: Uuid) -> Option<Uuid> {
        self.nodes
            .get(&id)
            .filter(|n| allows_same_name_siblings(&n.node_type))
            .and_then(|n| n.parent)
    }

    fn touch(&mut self, id: Uuid) -> StoreResult<()> {
        self.get_mut(id)?.revision += 1;
        Ok(())
    }

    fn remove_subtree(&mut self, id: Uuid) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    /// Apply one change. Revisions move forward on every modification.
    fn apply(&mut self, change: &Change) -> StoreResult<()> {
        match change {
            Change::Add {
                id,
                parent,
                name,
                node_type,
                properties,
            } => {
                self.get(*parent)?;
                self.ensure_unique(*parent, name, node_type, None)?;
                self.nodes.insert(
                    *id,
                    Node {
                        id: *id,
                        name: name.clone(),
                        node_type: node_type.clone(),
                        parent: Some(*parent),
                        children: Vec::new(),
                        properties: properties.clone(),
                        revision: 1,
                        versions: Vec::new(),
                    },
                );
                self.get_mut(*parent)?.children.push(*id);
                if allows_same_name_siblings(node_type) {
                    self.touch(*parent)?;
                }
            }
            Change::SetProperties { id, properties } => {
                let node = self.get_mut(*id)?;
                node.properties = properties.clone();
                node.revision += 1;
            }
            Change::Move { id, parent, name } => {
                let node_type = self.get(*id)?.node_type.clone();
                let old_parent = self.get(*id)?.parent;
                self.get(*parent)?;
                self.ensure_unique(*parent, name, &node_type, Some(*id))?;
                if let Some(old_parent) = old_parent {
                    self.get_mut(old_parent)?.children.retain(|c| c != id);
                }
                self.get_mut(*parent)?.children.push(*id);
                if allows_same_name_siblings(&node_type) {
                    if let Some(old_parent) = old_parent {
                        self.touch(old_parent)?;
                    }
                    if old_parent != Some(*parent) {
                        self.touch(*parent)?;
                    }
                }
                let node = self.get_mut(*id)?;
                node.parent = Some(*parent);
                node.name = name.clone();
                node.revision += 1;
            }
            Change::Remove { id } => {
                let parent = self.get(*id)?.parent;
                let guard = self.membership_guard(*id);
                if let Some(parent) = parent {
                    self.get_mut(parent)?.children.retain(|c| c != id);
                }
                self.remove_subtree(*id);
                if let Some(guard) = guard {
                    self.touch(guard)?;
                }
            }
            Change::Checkin { id, version } => {
                let node = self.get_mut(*id)?;
                node.versions.push(version.clone());
                node.revision += 1;
            }
        }
        Ok(())
    }

    fn view(&self, id: Uuid) -> StoreResult<NodeView> {
        let node = self.get(id)?;
        Ok(NodeView {
            id: node.id,
            name: node.name.clone(),
            path: self.path_of(id),
            node_type: node.node_type.clone(),
            properties: node.properties.clone(),
        })
    }
}

#[derive(Debug, Clone)]
enum Change {
    Add {
        id: Uuid,
        parent: Uuid,
        name: String,
        node_type: String,
        properties: Map<String, Value>,
    },
    SetProperties {
        id: Uuid,
        properties: Map<String, Value>,
    },
    Move {
        id: Uuid,
        parent: Uuid,
        name: String,
    },
    Remove {
        id: Uuid,
    },
    Checkin {
        id: Uuid,
        version: Version,
    },
}

impl Change {
    /// Existing nodes whose revisions this change depends on, as seen in `base`.
    ///
    /// Adding, moving or removing a variant or request also depends on the
    /// parent, so that two sessions cannot each add a sibling of the same kind.
    fn guarded(&self, base: &Tree) -> Vec<Uuid> {
        match self {
            Change::Add {
                parent, node_type, ..
            } => {
                if allows_same_name_siblings(node_type) {
                    vec![*parent]
                } else {
                    Vec::new()
                }
            }
            Change::Move { id, parent, .. } => {
                let mut ids = vec![*id];
                if let Some(old_parent) = base.membership_guard(*id) {
                    ids.push(old_parent);
                    ids.push(*parent);
                }
                ids
            }
            Change::Remove { id } => {
                let mut ids = vec![*id];
                ids.extend(base.membership_guard(*id));
                ids
            }
            Change::SetProperties { id, .. } | Change::Checkin { id, .. } => vec![*id],
        }
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Snapshot of a node as seen by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub node_type: String,
    pub properties: Map<String, Value>,
}

/// Store observation event, published after a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node was created at, or moved to, `path`
    Added { path: String, node_type: String },
}

/// Shared in-memory store.
#[derive(Debug)]
pub struct Repository {
    tree: RwLock<Tree>,
    locks: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<NodeEvent>,
}

impl Repository {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            tree: RwLock::new(Tree::new()),
            locks: Mutex::new(HashMap::new()),
            clock,
            events,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open a session acting as `user_id`.
    pub fn session(self: &Arc<Self>, user_id: &str) -> Session {
        let snapshot = self.tree.read().clone();
        Session {
            repo: Arc::clone(self),
            user_id: user_id.to_string(),
            working: snapshot.clone(),
            base: snapshot,
            changes: Vec::new(),
        }
    }

    /// Subscribe to node-added events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.read().resolve(path).is_ok()
    }

    fn commit(&self, base: &Tree, changes: &[Change]) -> StoreResult<()> {
        let events = {
            let mut shared = self.tree.write();

            for id in changes.iter().flat_map(|c| c.guarded(base)) {
                let Some(seen) = base.nodes.get(&id) else {
                    // created earlier in this session
                    continue;
                };
                match shared.nodes.get(&id) {
                    Some(current) if current.revision == seen.revision => {}
                    _ => return Err(StoreError::Conflict(base.path_of(id))),
                }
            }

            let mut next = shared.clone();
            let mut events = Vec::new();
            for change in changes {
                next.apply(change).map_err(|e| match e {
                    StoreError::NotFound(what) => StoreError::Conflict(what),
                    other => other,
                })?;
                if let Change::Add { id, .. } | Change::Move { id, .. } = change {
                    if let Ok(node) = next.get(*id) {
                        events.push(NodeEvent::Added {
                            path: next.path_of(*id),
                            node_type: node.node_type.clone(),
                        });
                    }
                }
            }
            *shared = next;
            events
        };

        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

impl LockManager for Repository {
    fn try_lock(&self, path: &str, lease_seconds: u64, owner: &str) -> StoreResult<Lease> {
        if !self.exists(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let now = self.now();
        let mut locks = self.locks.lock();

        if let Some(current) = locks.get(path) {
            if !current.is_expired_at(now) {
                return Err(StoreError::AlreadyLocked(path.to_string()));
            }
            info!(
                path = %path,
                previous_owner = %current.owner,
                "Reclaiming expired lease"
            );
        }

        let lease = Lease::new(path, owner, lease_seconds, now);
        locks.insert(path.to_string(), lease.clone());
        debug!(path = %path, owner = %owner, token = %lease.token, "Lease acquired");
        Ok(lease)
    }

    fn refresh_lease(&self, lease: &Lease) -> StoreResult<Lease> {
        let now = self.now();
        let mut locks = self.locks.lock();
        match locks.get_mut(&lease.path) {
            Some(current) if current.token == lease.token => {
                current.renew(now);
                Ok(current.clone())
            }
            _ => Err(StoreError::LockLost(lease.path.clone())),
        }
    }

    fn unlock(&self, lease: &Lease) -> StoreResult<()> {
        let mut locks = self.locks.lock();
        match locks.get(&lease.path) {
            Some(current) if current.token == lease.token => {
                if let Some(mut released) = locks.remove(&lease.path) {
                    released.mark_released();
                    debug!(path = %released.path, owner = %released.owner, "Lease released");
                }
                Ok(())
            }
            _ => Err(StoreError::LockLost(lease.path.clone())),
        }
    }

    fn is_locked(&self, path: &str) -> bool {
        self.locks.lock().contains_key(path)
    }

    fn get_lock(&self, path: &str) -> Option<Lease> {
        self.locks.lock().get(path).cloned()
    }

    fn expire_lock(&self, path: &str) -> bool {
        let now = self.now();
        let mut locks = self.locks.lock();
        match locks.get(path) {
            None => true,
            Some(current) if !current.is_expired_at(now) => false,
            Some(_) => {
                if let Some(mut expired) = locks.remove(path) {
                    expired.mark_expired();
                    warn!(
                        path = %path,
                        owner = %expired.owner,
                        expired_at = %expired.expires_at,
                        "Expired lease reclaimed"
                    );
                }
                true
            }
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// A unit of work against the repository.
#[derive(Debug)]
pub struct Session {
    repo: Arc<Repository>,
    user_id: String,
    base: Tree,
    working: Tree,
    changes: Vec<Change>,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.repo.now()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn record(&mut self, change: Change) -> StoreResult<()> {
        self.working.apply(&change)?;
        self.changes.push(change);
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.working.resolve(path).is_ok()
    }

    pub fn node(&self, path: &str) -> StoreResult<NodeView> {
        let id = self.working.resolve(path)?;
        self.working.view(id)
    }

    pub fn node_by_id(&self, id: Uuid) -> StoreResult<NodeView> {
        self.working.view(id)
    }

    /// Children of the node at `path`, in order.
    pub fn children(&self, path: &str) -> StoreResult<Vec<NodeView>> {
        let id = self.working.resolve(path)?;
        self.working
            .get(id)?
            .children
            .iter()
            .map(|c| self.working.view(*c))
            .collect()
    }

    pub fn add_node(
        &mut self,
        parent_path: &str,
        name: &str,
        node_type: &str,
        properties: Map<String, Value>,
    ) -> StoreResult<Uuid> {
        validate_name(name)?;
        let parent = self.working.resolve(parent_path)?;
        let id = Uuid::new_v4();
        self.record(Change::Add {
            id,
            parent,
            name: name.to_string(),
            node_type: node_type.to_string(),
            properties,
        })?;
        Ok(id)
    }

    /// Create every missing folder along `path`; returns the id of the last segment.
    pub fn ensure_path(&mut self, path: &str) -> StoreResult<Uuid> {
        if !path.starts_with('/') {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        let mut current = "/".to_string();
        let mut id = self.working.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            id = match self.working.child_named(id, segment) {
                Some(existing) => existing,
                None => self.add_node(&current, segment, NT_FOLDER, Map::new())?,
            };
            current = join_path(&current, segment);
        }
        Ok(id)
    }

    pub fn set_properties(&mut self, id: Uuid, properties: Map<String, Value>) -> StoreResult<()> {
        self.working.get(id)?;
        self.record(Change::SetProperties { id, properties })
    }

    pub fn move_node(&mut self, id: Uuid, dest_parent_path: &str, new_name: &str) -> StoreResult<()> {
        validate_name(new_name)?;
        let parent = self.working.resolve(dest_parent_path)?;
        self.record(Change::Move {
            id,
            parent,
            name: new_name.to_string(),
        })
    }

    pub fn remove_node(&mut self, id: Uuid) -> StoreResult<()> {
        if id == self.working.root {
            return Err(StoreError::InvalidPath("/".to_string()));
        }
        self.working.get(id)?;
        self.record(Change::Remove { id })
    }

    /// Create a document handle at `path`, creating parent folders as needed.
    pub fn create_handle(&mut self, path: &str) -> StoreResult<HandleSession<'_>> {
        let (parent, name) = path
            .rsplit_once('/')
            .filter(|(_, name)| !name.is_empty())
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        let parent = if parent.is_empty() { "/" } else { parent };
        self.ensure_path(parent)?;
        if self.exists(path) {
            return Err(StoreError::ItemExists(path.to_string()));
        }
        let id = self.add_node(parent, name, NT_HANDLE, Map::new())?;
        Ok(HandleSession {
            session: self,
            handle_id: id,
            path: path.to_string(),
        })
    }

    /// Open the document handle at `path`.
    pub fn handle(&mut self, path: &str) -> StoreResult<HandleSession<'_>> {
        let id = self.working.resolve(path)?;
        if self.working.get(id)?.node_type != NT_HANDLE {
            return Err(StoreError::InvalidPath(format!("{} is not a document handle", path)));
        }
        Ok(HandleSession {
            session: self,
            handle_id: id,
            path: path.to_string(),
        })
    }

    /// Persist all buffered changes atomically, then pick up the latest state.
    pub fn save(&mut self) -> StoreResult<()> {
        if !self.changes.is_empty() {
            self.repo.commit(&self.base, &self.changes)?;
            debug!(user = %self.user_id, changes = self.changes.len(), "Session saved");
        }
        self.refresh(false)
    }

    /// Reload from the repository. With `keep_changes`, buffered changes are
    /// replayed on top of the fresh state.
    pub fn refresh(&mut self, keep_changes: bool) -> StoreResult<()> {
        let snapshot = self.repo.tree.read().clone();
        let mut working = snapshot.clone();
        if keep_changes {
            for change in &self.changes {
                working.apply(change)?;
            }
        } else {
            self.changes.clear();
        }
        self.base = snapshot;
        self.working = working;
        Ok(())
    }

    fn child_of_type(&self, parent: Uuid, id: &str, node_type: &str) -> StoreResult<Uuid> {
        let node_id = Uuid::parse_str(id).map_err(|_| StoreError::NotFound(id.to_string()))?;
        match self.working.nodes.get(&node_id) {
            Some(node) if node.parent == Some(parent) && node.node_type == node_type => Ok(node_id),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn children_of_type(&self, parent: Uuid, node_type: &str) -> StoreResult<Vec<&Node>> {
        let node = self.working.get(parent)?;
        Ok(node
            .children
            .iter()
            .filter_map(|c| self.working.nodes.get(c))
            .filter(|n| n.node_type == node_type)
            .collect())
    }
}

// ============================================================================
// HANDLE ACCESS
// ============================================================================

/// A document handle opened within a session.
#[derive(Debug)]
pub struct HandleSession<'s> {
    session: &'s mut Session,
    handle_id: Uuid,
    path: String,
}

impl HandleSession<'_> {
    pub fn session(&self) -> &Session {
        &*self.session
    }

    fn record_from_node<T: serde::de::DeserializeOwned>(node: &Node) -> StoreResult<T> {
        let mut properties = node.properties.clone();
        properties.insert("id".to_string(), Value::String(node.id.to_string()));
        serde_json::from_value(Value::Object(properties)).map_err(|e| {
            StoreError::Invariant(format!("malformed {} node {}: {}", node.node_type, node.id, e))
        })
    }

    fn record_properties<T: serde::Serialize>(record: &T) -> StoreResult<Map<String, Value>> {
        match serde_json::to_value(record) {
            Ok(Value::Object(mut map)) => {
                map.remove("id");
                Ok(map)
            }
            Ok(_) => Err(StoreError::Invariant("record did not serialize to an object".to_string())),
            Err(e) => Err(StoreError::Invariant(e.to_string())),
        }
    }

    fn handle_name(&self) -> StoreResult<String> {
        Ok(self.session.working.get(self.handle_id)?.name.clone())
    }
}

impl ContentHandle for HandleSession<'_> {
    fn path(&self) -> &str {
        &self.path
    }

    fn name(&self) -> StoreResult<String> {
        self.handle_name()
    }

    fn now(&self) -> DateTime<Utc> {
        self.session.now()
    }

    fn variants(&self) -> StoreResult<Vec<DocumentVariant>> {
        self.session
            .children_of_type(self.handle_id, NT_VARIANT)?
            .into_iter()
            .map(Self::record_from_node)
            .collect()
    }

    fn requests(&self) -> StoreResult<Vec<PublicationRequest>> {
        self.session
            .children_of_type(self.handle_id, NT_REQUEST)?
            .into_iter()
            .map(Self::record_from_node)
            .collect()
    }

    fn add_variant(&mut self, variant: DocumentVariant) -> StoreResult<String> {
        let name = self.handle_name()?;
        let properties = Self::record_properties(&variant)?;
        let id = self
            .session
            .add_node(&self.path, &name, NT_VARIANT, properties)?;
        Ok(id.to_string())
    }

    fn update_variant(&mut self, variant: &DocumentVariant) -> StoreResult<()> {
        let id = self
            .session
            .child_of_type(self.handle_id, &variant.id, NT_VARIANT)?;
        let properties = Self::record_properties(variant)?;
        self.session.set_properties(id, properties)
    }

    fn remove_variant(&mut self, id: &str) -> StoreResult<()> {
        let id = self.session.child_of_type(self.handle_id, id, NT_VARIANT)?;
        self.session.remove_node(id)
    }

    fn set_holder(&mut self, id: &str, holder: Option<&str>) -> StoreResult<()> {
        let node_id = self.session.child_of_type(self.handle_id, id, NT_VARIANT)?;
        let mut variant: DocumentVariant = Self::record_from_node(self.session.working.get(node_id)?)?;
        variant.holder = holder.map(str::to_string);
        self.update_variant(&variant)
    }

    fn add_request(&mut self, request: PublicationRequest) -> StoreResult<String> {
        let properties = Self::record_properties(&request)?;
        let id = self
            .session
            .add_node(&self.path, "request", NT_REQUEST, properties)?;
        Ok(id.to_string())
    }

    fn update_request(&mut self, request: &PublicationRequest) -> StoreResult<()> {
        let id = self
            .session
            .child_of_type(self.handle_id, &request.id, NT_REQUEST)?;
        let properties = Self::record_properties(request)?;
        self.session.set_properties(id, properties)
    }

    fn remove_request(&mut self, id: &str) -> StoreResult<()> {
        let id = self.session.child_of_type(self.handle_id, id, NT_REQUEST)?;
        self.session.remove_node(id)
    }

    fn rename(&mut self, new_name: &str) -> StoreResult<()> {
        validate_name(new_name)?;
        let parent_path = match self.path.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
            None => return Err(StoreError::InvalidPath(self.path.clone())),
        };

        self.session.move_node(self.handle_id, &parent_path, new_name)?;
        self.path = join_path(&parent_path, new_name);

        let variant_ids: Vec<Uuid> = self
            .session
            .children_of_type(self.handle_id, NT_VARIANT)?
            .into_iter()
            .map(|n| n.id)
            .collect();
        let handle_path = self.path.clone();
        for id in variant_ids {
            self.session.move_node(id, &handle_path, new_name)?;
        }
        Ok(())
    }

    fn checkin(&mut self, id: &str) -> StoreResult<Version> {
        let node_id = self.session.child_of_type(self.handle_id, id, NT_VARIANT)?;
        let node = self.session.working.get(node_id)?;
        let variant: DocumentVariant = Self::record_from_node(node)?;
        let version = Version {
            index: node.versions.len() + 1,
            created: self.session.now(),
            content: variant.content,
        };
        self.session.record(Change::Checkin {
            id: node_id,
            version: version.clone(),
        })?;
        Ok(version)
    }

    fn versions(&self, id: &str) -> StoreResult<Vec<Version>> {
        let node_id = self.session.child_of_type(self.handle_id, id, NT_VARIANT)?;
        Ok(self.session.working.get(node_id)?.versions.clone())
    }

    fn save(&mut self) -> StoreResult<()> {
        self.session.save()
    }

    fn refresh(&mut self, keep_changes: bool) -> StoreResult<()> {
        self.session.refresh(keep_changes)
    }
}
