//! Client registry for Murmur.
//!
//! The registry is the single owner of every [`ClientRecord`]. All access
//! goes through one lock that is only ever held for in-memory map
//! operations; callers that need to iterate take a [`snapshot`] and release
//! the lock before doing anything else.
//!
//! [`snapshot`]: ClientRegistry::snapshot

use crate::handle::SendHandle;
use murmur_protocol::{StateFields, UserState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Maximum display name length, in characters.
pub const MAX_NAME_LENGTH: usize = 64;

/// Identifier of one live connection.
///
/// Allocated from a per-registry counter, so an id is never handed out twice
/// while the registry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Numeric value of the id.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Validate and normalize a display name.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, or contains
/// control characters.
pub fn validate_display_name(name: &str) -> Result<String, &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Display name cannot be empty");
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err("Display name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Display name contains control characters");
    }
    Ok(name.to_string())
}

/// Everything the relay knows about one client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Connection identifier.
    pub id: ClientId,
    /// Display name; not unique.
    pub name: String,
    /// Last known presence fields.
    pub state: StateFields,
    /// Outbound queue for this client.
    pub handle: SendHandle,
}

impl ClientRecord {
    /// The client's presence as reported by `states`.
    #[must_use]
    pub fn user_state(&self) -> UserState {
        UserState {
            username: self.name.clone(),
            state: self.state.clone(),
        }
    }
}

/// Thread-safe map from [`ClientId`] to [`ClientRecord`].
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client with a default display name.
    pub fn register(&self, handle: SendHandle) -> ClientId {
        self.register_with(handle, None, |_| {})
    }

    /// Register a client under `name`, or the default name if `None`.
    ///
    /// `prepare` sees the record after its id is allocated and before it
    /// becomes visible to lookups and snapshots, so anything it enqueues on
    /// the handle precedes every fan-out that can reach the client.
    pub fn register_with(
        &self,
        handle: SendHandle,
        name: Option<String>,
        prepare: impl FnOnce(&ClientRecord),
    ) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = ClientRecord {
            id,
            name: name.unwrap_or_else(|| format!("User_{}", id.0)),
            state: StateFields::new(),
            handle,
        };
        prepare(&record);

        let count = {
            let mut clients = self.clients.write();
            clients.insert(id, record);
            clients.len()
        };

        debug!(client = %id, clients = count, "Client registered");
        id
    }

    /// Remove a client.
    ///
    /// Returns the removed record, or `None` if it was already gone. Calling
    /// this more than once for the same id is harmless.
    pub fn unregister(&self, id: ClientId) -> Option<ClientRecord> {
        let removed = self.clients.write().remove(&id);
        if let Some(record) = &removed {
            debug!(client = %id, name = %record.name, "Client unregistered");
        }
        removed
    }

    /// Merge fields into a client's state, key by key.
    ///
    /// Returns `false` (and changes nothing) if the client is gone.
    pub fn update_state(&self, id: ClientId, fields: &StateFields) -> bool {
        let mut clients = self.clients.write();
        match clients.get_mut(&id) {
            Some(record) => {
                for (key, value) in fields {
                    record.state.insert(key.clone(), value.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Set a client's display name.
    ///
    /// Returns the previous name, or `None` if the client is gone.
    pub fn rename(&self, id: ClientId, name: impl Into<String>) -> Option<String> {
        let mut clients = self.clients.write();
        clients
            .get_mut(&id)
            .map(|record| std::mem::replace(&mut record.name, name.into()))
    }

    /// All clients whose display name equals `name`, in id order.
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .clients
            .read()
            .values()
            .filter(|record| record.name == name)
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// A consistent point-in-time copy of every record, in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientRecord> {
        let mut records: Vec<ClientRecord> = self.clients.read().values().cloned().collect();
        records.sort_unstable_by_key(|record| record.id);
        records
    }

    /// A copy of one record.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<ClientRecord> {
        self.clients.read().get(&id).cloned()
    }

    /// A client's current display name.
    #[must_use]
    pub fn name_of(&self, id: ClientId) -> Option<String> {
        self.clients.read().get(&id).map(|record| record.name.clone())
    }

    /// A client's current outbound handle.
    #[must_use]
    pub fn handle(&self, id: ClientId) -> Option<SendHandle> {
        self.clients.read().get(&id).map(|record| record.handle.clone())
    }

    /// Display names of every client, in id order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|record| record.name).collect()
    }

    /// Whether a client is registered.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn handle() -> SendHandle {
        SendHandle::channel(8).0
    }

    fn fields(value: serde_json::Value) -> StateFields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_register_ids_are_unique() {
        let registry = ClientRegistry::new();
        let ids: Vec<ClientId> = (0..100).map(|_| registry.register(handle())).collect();
        let unique: HashSet<ClientId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_ids_not_reused_after_unregister() {
        let registry = ClientRegistry::new();
        let first = registry.register(handle());
        registry.unregister(first);
        let second = registry.register(handle());
        assert_ne!(first, second);
    }

    #[test]
    fn test_concurrent_register_unique() {
        let registry = Arc::new(ClientRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.register(handle()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for thread in threads {
            for id in thread.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(registry.len(), 400);
    }

    #[test]
    fn test_register_with_prepares_before_visible() {
        let registry = ClientRegistry::new();
        let id = registry.register_with(handle(), Some("alice".into()), |record| {
            assert_eq!(record.name, "alice");
            assert!(!registry.contains(record.id));
        });
        assert_eq!(registry.name_of(id).as_deref(), Some("alice"));
    }

    #[test]
    fn test_default_name() {
        let registry = ClientRegistry::new();
        let id = registry.register(handle());
        assert_eq!(registry.name_of(id), Some(format!("User_{}", id.get())));
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = ClientRegistry::new();
        let id = registry.register(handle());

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_state_last_write_wins() {
        let registry = ClientRegistry::new();
        let id = registry.register(handle());

        assert!(registry.update_state(id, &fields(json!({"x": 1, "y": "a"}))));
        assert!(registry.update_state(id, &fields(json!({"x": 2}))));

        let record = registry.get(id).unwrap();
        assert_eq!(record.state.get("x"), Some(&json!(2)));
        // Untouched keys survive the merge.
        assert_eq!(record.state.get("y"), Some(&json!("a")));
    }

    #[test]
    fn test_update_after_unregister_does_not_resurrect() {
        let registry = ClientRegistry::new();
        let id = registry.register(handle());
        registry.unregister(id);

        assert!(!registry.update_state(id, &fields(json!({"x": 1}))));
        assert!(registry.rename(id, "ghost").is_none());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_by_name_returns_all_matches() {
        let registry = ClientRegistry::new();
        let a1 = registry.register(handle());
        let b = registry.register(handle());
        let a2 = registry.register(handle());
        registry.rename(a1, "alice");
        registry.rename(b, "bob");
        registry.rename(a2, "alice");

        assert_eq!(registry.lookup_by_name("alice"), vec![a1, a2]);
        assert_eq!(registry.lookup_by_name("bob"), vec![b]);
        assert!(registry.lookup_by_name("carol").is_empty());
    }

    #[test]
    fn test_rename_returns_previous_name() {
        let registry = ClientRegistry::new();
        let id = registry.register(handle());
        let old = registry.rename(id, "alice").unwrap();
        assert!(old.starts_with("User_"));
        assert_eq!(registry.name_of(id).as_deref(), Some("alice"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = ClientRegistry::new();
        let a = registry.register(handle());
        let b = registry.register(handle());

        let snapshot = registry.snapshot();
        registry.unregister(a);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, a);
        assert_eq!(snapshot[1].id, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_validate_display_name() {
        assert_eq!(validate_display_name("  alice ").unwrap(), "alice");
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name("bad\nname").is_err());
        assert!(validate_display_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(validate_display_name(&"a".repeat(MAX_NAME_LENGTH)).is_ok());
    }
}
