use lapin::options::{
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use tracing::{debug, warn};

use super::ConnectionFactory;
use crate::provisioning::{Binding, ExchangeOptions, QueueOptions};
use crate::transport::{CloseNotifier, Transport};

const REPLY_SUCCESS: u16 = 200;

/// A [`Transport`] speaking AMQP 0.9.1 to a RabbitMq broker through `lapin`.
///
/// Channels are put in [publisher confirms](https://www.rabbitmq.com/confirms.html) mode when
/// they are opened, unless [`AmqpTransport::without_publisher_confirmations`] is used.
#[derive(Clone)]
pub struct AmqpTransport {
    factory: ConnectionFactory,
    publisher_confirms: bool,
}

impl AmqpTransport {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            publisher_confirms: true,
        }
    }

    /// Open channels without enabling publisher confirms.
    #[must_use]
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    type Connection = lapin::Connection;
    type Channel = lapin::Channel;

    async fn connect(&self, on_lost: CloseNotifier) -> Result<lapin::Connection, anyhow::Error> {
        let connection = self.factory.new_connection().await?;
        connection.on_error(move |e| {
            warn!(error = ?e, "RabbitMQ broken connection");
            on_lost.notify();
        });
        Ok(connection)
    }

    async fn close_connection(&self, connection: &lapin::Connection) {
        if !connection.status().connected() {
            return;
        }
        if let Err(e) = connection.close(REPLY_SUCCESS, "OK").await {
            debug!(error = ?e, "Failed to close RabbitMQ connection");
        }
    }

    async fn open_channel(
        &self,
        connection: &lapin::Connection,
        on_close: CloseNotifier,
    ) -> Result<lapin::Channel, anyhow::Error> {
        let channel = connection.create_channel().await?;
        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        channel.on_error(move |e| {
            debug!(error = ?e, "RabbitMQ channel closed");
            on_close.notify();
        });
        Ok(channel)
    }

    async fn close_channel(&self, channel: &lapin::Channel) {
        if !channel.status().connected() {
            return;
        }
        if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = ?e, channel = channel.id(), "Failed to close RabbitMQ channel");
        }
    }

    async fn declare_exchange(
        &self,
        channel: &lapin::Channel,
        exchange_name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), anyhow::Error> {
        channel
            .exchange_declare(
                exchange_name,
                options.kind.into(),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..ExchangeDeclareOptions::default()
                },
                Default::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &lapin::Channel,
        queue_name: &str,
        options: &QueueOptions,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                options.arguments(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        channel: &lapin::Channel,
        queue_name: &str,
        exchange_name: &str,
        binding: &Binding,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_bind(
                queue_name,
                exchange_name,
                binding.key(),
                QueueBindOptions { nowait: false },
                binding.arguments(),
            )
            .await?;
        Ok(())
    }
}
