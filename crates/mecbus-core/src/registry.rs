//! Client registry: every attached connection, keyed by entry id and,
//! once named, by its `(client_name, instance_name)` pair.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::client::{ClientInfo, EvlClient};
use crate::error::{BusError, Result};

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<u64, EvlClient>,
    by_name: HashMap<(String, String), u64>,
}

/// Registry of attached clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted/connected (still anonymous) client.
    pub fn register(&self, client: EvlClient) {
        let mut inner = self.inner.lock().expect("client registry poisoned");
        inner.by_id.insert(client.id(), client);
    }

    /// Attach a name to a registered client.
    ///
    /// The `(client_name, instance_name)` pair must be unique among
    /// attached clients; on conflict the rename is rejected and the
    /// client keeps its prior identity.
    pub fn attach_name(&self, client: &EvlClient, info: ClientInfo) -> Result<()> {
        let key = info.name_key();
        let mut inner = self.inner.lock().expect("client registry poisoned");
        if let Some(&owner) = inner.by_name.get(&key) {
            if owner != client.id() {
                return Err(BusError::ClientAlreadyExists {
                    client_name: key.0,
                    instance_name: key.1,
                });
            }
        }
        // Drop any previous name this entry held.
        let old_key = client.info().name_key();
        if client.info().is_named() && old_key != key {
            inner.by_name.remove(&old_key);
        }
        inner.by_name.insert(key.clone(), client.id());
        client.set_info(info);
        debug!(client = %key.0, instance = %key.1, "client attached");
        Ok(())
    }

    /// Detach and drop a client. Returns the entry if it was present.
    pub fn deregister(&self, client: &EvlClient) -> Option<EvlClient> {
        let mut inner = self.inner.lock().expect("client registry poisoned");
        let entry = inner.by_id.remove(&client.id());
        let key = client.info().name_key();
        if let Some(&owner) = inner.by_name.get(&key) {
            if owner == client.id() {
                inner.by_name.remove(&key);
            }
        }
        entry
    }

    /// Look up an attached client by name.
    pub fn lookup(&self, client_name: &str, instance_name: &str) -> Option<EvlClient> {
        let inner = self.inner.lock().expect("client registry poisoned");
        let id = inner
            .by_name
            .get(&(client_name.to_string(), instance_name.to_string()))?;
        inner.by_id.get(id).cloned()
    }

    pub fn get_by_id(&self, id: u64) -> Option<EvlClient> {
        let inner = self.inner.lock().expect("client registry poisoned");
        inner.by_id.get(&id).cloned()
    }

    /// Snapshot of every attached client.
    pub fn clients(&self) -> Vec<EvlClient> {
        let inner = self.inner.lock().expect("client registry poisoned");
        inner.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("client registry poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;

    fn named_info(name: &str, inst: &str) -> ClientInfo {
        let mut info = ClientInfo::anonymous(ClientType::Client);
        info.client_name = name.to_string();
        info.instance_name = inst.to_string();
        info
    }

    #[test]
    fn test_name_uniqueness_one_winner() {
        let reg = ClientRegistry::new();
        let a = EvlClient::detached(ClientType::Client);
        let b = EvlClient::detached(ClientType::Client);
        reg.register(a.clone());
        reg.register(b.clone());

        reg.attach_name(&a, named_info("svc", "main")).unwrap();
        let err = reg.attach_name(&b, named_info("svc", "main")).unwrap_err();
        assert!(matches!(err, BusError::ClientAlreadyExists { .. }));

        // Loser keeps its prior (anonymous) identity.
        assert!(!b.info().is_named());
        assert_eq!(reg.lookup("svc", "main").unwrap(), a);
    }

    #[test]
    fn test_rename_releases_old_key() {
        let reg = ClientRegistry::new();
        let a = EvlClient::detached(ClientType::Client);
        reg.register(a.clone());
        reg.attach_name(&a, named_info("one", "x")).unwrap();
        reg.attach_name(&a, named_info("two", "x")).unwrap();

        assert!(reg.lookup("one", "x").is_none());
        assert_eq!(reg.lookup("two", "x").unwrap(), a);
    }

    #[test]
    fn test_name_reusable_after_deregister() {
        let reg = ClientRegistry::new();
        let a = EvlClient::detached(ClientType::Client);
        let b = EvlClient::detached(ClientType::Client);
        reg.register(a.clone());
        reg.register(b.clone());

        reg.attach_name(&a, named_info("svc", "main")).unwrap();
        reg.deregister(&a);
        reg.attach_name(&b, named_info("svc", "main")).unwrap();
        assert_eq!(reg.lookup("svc", "main").unwrap(), b);
    }
}
