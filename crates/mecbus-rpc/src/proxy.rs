//! Proxy nodes: the caller-side stand-in for a remote (or local)
//! service instance.
//!
//! Proxies to the same instance share one node through the binding's
//! proxy table; the node notifies the host with a best-effort destroy
//! when the last proxy handle drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use uuid::Uuid;

use crate::client::BindingInner;
use crate::error::Result;

pub(crate) struct ProxyNode {
    binding: Arc<BindingInner>,
    class_name: String,
    instance_id: u64,
    /// Ask the host to recreate the instance if the id went stale.
    renew: AtomicBool,
    /// Result payload of the most recent call through this node.
    last_result: Mutex<Option<Bytes>>,
}

impl ProxyNode {
    pub(crate) fn new(binding: Arc<BindingInner>, class_name: String, instance_id: u64) -> Self {
        Self {
            binding,
            class_name,
            instance_id,
            renew: AtomicBool::new(false),
            last_result: Mutex::new(None),
        }
    }
}

impl Drop for ProxyNode {
    fn drop(&mut self) {
        self.binding.notify_destroy(&self.class_name, self.instance_id);
    }
}

/// Caller handle to one service instance.
#[derive(Clone)]
pub struct RpcProxy {
    node: Arc<ProxyNode>,
}

impl RpcProxy {
    pub(crate) fn from_node(node: Arc<ProxyNode>) -> Self {
        Self { node }
    }

    pub fn class_name(&self) -> &str {
        &self.node.class_name
    }

    pub fn instance_id(&self) -> u64 {
        self.node.instance_id
    }

    /// Once set, every later call carries the renew flag so the host
    /// rebuilds the instance if its id went stale.
    pub fn set_renew(&self, renew: bool) {
        self.node.renew.store(renew, Ordering::Relaxed);
    }

    /// Result payload of the most recent successful call, if any.
    pub fn last_result(&self) -> Option<Bytes> {
        self.node
            .last_result
            .lock()
            .expect("proxy result poisoned")
            .clone()
    }

    /// Invoke a method on the instance this proxy stands for.
    pub async fn call(&self, method: Uuid, payload: Bytes) -> Result<Bytes> {
        let result = self
            .node
            .binding
            .call_method(
                &self.node.class_name,
                self.node.instance_id,
                self.node.renew.load(Ordering::Relaxed),
                method,
                payload,
            )
            .await?;
        *self
            .node
            .last_result
            .lock()
            .expect("proxy result poisoned") = Some(result.clone());
        Ok(result)
    }
}
