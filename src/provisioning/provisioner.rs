use crate::pool::{ChannelPool, PoolError};
use crate::provisioning::{is_default_exchange, QueueSpec};
use crate::transport::Transport;

/// Declare every queue in `specs`, in order, together with its exchange and binding.
///
/// Each spec is declared on its own leased channel, released as soon as the spec is done.
/// Declarations have declare-if-not-exists semantics on the broker: provisioning the same specs
/// twice is not an error.
///
/// The first failing declaration aborts provisioning: later specs are not declared and the
/// ones already declared are left in place.
#[tracing::instrument(name = "provision_queues", skip_all, fields(pool = %pool.id(), n_queues = specs.len()))]
pub async fn provision<T: Transport>(
    pool: &ChannelPool<T>,
    specs: &[QueueSpec],
) -> Result<(), PoolError> {
    for spec in specs {
        declare(pool, spec)
            .await
            .map_err(|source| PoolError::ProvisioningFailure {
                queue: spec.queue_name.clone(),
                source,
            })?;
        tracing::debug!(queue = %spec.queue_name, exchange = %spec.exchange_name, "queue provisioned");
    }
    Ok(())
}

async fn declare<T: Transport>(
    pool: &ChannelPool<T>,
    spec: &QueueSpec,
) -> Result<(), anyhow::Error> {
    let transport = pool.transport();
    pool.with_channel(|lease| async move {
        let channel = lease?;
        if !is_default_exchange(&spec.exchange_name) {
            transport
                .declare_exchange(&channel, &spec.exchange_name, &spec.exchange_options)
                .await?;
        }
        transport
            .declare_queue(&channel, &spec.queue_name, &spec.queue_options)
            .await?;
        if let Some(binding) = spec.effective_binding() {
            transport
                .bind_queue(&channel, &spec.queue_name, &spec.exchange_name, &binding)
                .await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}
