//! Service implementation surface: the object trait method handlers
//! run against, the factory and handler signatures a host's class table
//! stores, and the lifecycle hooks a service implementation can plug
//! into its host.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Lifecycle state of a hosted service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// One live service object held by an instance node.
pub trait ServiceObject: Send + Sync + 'static {
    /// Downcast access for method handlers.
    fn as_any(&self) -> &dyn Any;

    /// Invoked once per visitor when that visitor's connection goes
    /// away or explicitly stops.
    fn on_unbind(&self) {}
}

/// Builds a service object from the get-instance parameter blob.
pub type InstanceFactory =
    Arc<dyn Fn(&[u8]) -> Result<Arc<dyn ServiceObject>> + Send + Sync>;

/// One registered method. Receives the target object and the opaque
/// argument blob, returns the opaque result blob.
pub type MethodHandler =
    Arc<dyn Fn(Arc<dyn ServiceObject>, Bytes) -> Result<Bytes> + Send + Sync>;

/// Hooks a service implementation runs during its host's lifecycle.
#[async_trait]
pub trait ServiceLifecycle: Send + Sync {
    async fn on_create(&self) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}
