use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{ChannelLease, ChannelPool, ChannelPoolBuilder, LeaseError, LeaseState, PoolError};
use crate::provisioning::QueueOptions;
use crate::transport::Transport;

/// The name of a running pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    /// A new, random, pool name.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for PoolId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The set of running pools, addressed by name.
///
/// A registry is a plain value: pass it (or an `Arc` of it) to whoever needs to reach the
/// pools. Independent registries do not see each other's pools.
///
/// # Example
///
/// ```rust,no_run
/// use carrot_cake_pool::pool::{PoolRegistry, PoolSettings};
///
/// async fn example() -> anyhow::Result<()> {
///     let registry = PoolRegistry::default();
///     let settings: PoolSettings = serde_json::from_str(r#"{ "name": "payments" }"#)?;
///     let pool_id = registry.start(settings.builder()?).await?;
///
///     registry
///         .with_channel(&pool_id, |channel| async move {
///             let channel = channel?;
///             channel
///                 .basic_publish("", "refunds", Default::default(), b"{}", Default::default())
///                 .await?;
///             Ok::<_, anyhow::Error>(())
///         })
///         .await??;
///
///     registry.stop(&pool_id).await?;
///     Ok(())
/// }
/// ```
pub struct PoolRegistry<T: Transport> {
    pools: RwLock<HashMap<PoolId, Arc<ChannelPool<T>>>>,
}

impl<T: Transport> Default for PoolRegistry<T> {
    fn default() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Transport> PoolRegistry<T> {
    /// Start a pool and register it under its name.
    ///
    /// Fails with [`PoolError::AlreadyRegistered`] if a pool with the same name is running.
    pub async fn start(&self, builder: ChannelPoolBuilder<T>) -> Result<PoolId, PoolError> {
        let id = builder.id().clone();
        if self.pools.read().await.contains_key(&id) {
            return Err(PoolError::AlreadyRegistered(id));
        }

        let pool = builder.start().await?;
        let mut pools = self.pools.write().await;
        if pools.contains_key(&id) {
            drop(pools);
            pool.shutdown().await;
            return Err(PoolError::AlreadyRegistered(id));
        }
        pools.insert(id.clone(), Arc::new(pool));
        info!(pool = %id, "pool registered");
        Ok(id)
    }

    /// Look up a running pool.
    pub async fn resolve(&self, id: &PoolId) -> Result<Arc<ChannelPool<T>>, PoolError> {
        self.pools
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(id.clone()))
    }

    /// The names of the running pools.
    pub async fn pool_ids(&self) -> Vec<PoolId> {
        let mut ids: Vec<_> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unregister a pool and shut it down.
    pub async fn stop(&self, id: &PoolId) -> Result<(), PoolError> {
        let pool = self
            .pools
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PoolError::UnknownPool(id.clone()))?;
        pool.shutdown().await;
        info!(pool = %id, "pool stopped");
        Ok(())
    }

    /// Stop every pool.
    pub async fn stop_all(&self) {
        let pools: Vec<_> = self.pools.write().await.drain().collect();
        for (id, pool) in pools {
            pool.shutdown().await;
            info!(pool = %id, "pool stopped");
        }
    }

    /// See [`ChannelPool::with_channel`].
    pub async fn with_channel<F, Fut, R>(&self, id: &PoolId, body: F) -> Result<R, PoolError>
    where
        F: FnOnce(Result<ChannelLease<T>, LeaseError>) -> Fut,
        Fut: Future<Output = R>,
    {
        Ok(self.resolve(id).await?.with_channel(body).await)
    }

    /// See [`ChannelPool::raw_connection`].
    pub async fn raw_connection(&self, id: &PoolId) -> Result<Arc<T::Connection>, PoolError> {
        Ok(self.resolve(id).await?.raw_connection().await?)
    }

    /// See [`ChannelPool::create_queue_with_binding`].
    pub async fn create_queue_with_binding(
        &self,
        id: &PoolId,
        queue_name: &str,
        exchange_name: &str,
        options: QueueOptions,
    ) -> Result<(), PoolError> {
        self.resolve(id)
            .await?
            .create_queue_with_binding(queue_name, exchange_name, options)
            .await
    }

    /// See [`ChannelPool::describe_state`].
    pub async fn describe_state(&self, id: &PoolId, worker: usize) -> Result<LeaseState, PoolError> {
        Ok(self.resolve(id).await?.describe_state(worker).await?)
    }
}
