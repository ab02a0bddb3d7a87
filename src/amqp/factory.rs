use crate::amqp::configuration::BrokerSettings;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Clone)]
/// All the information required to open connections to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Fails if the TLS settings cannot be turned into a connector.
    pub fn new_from_config(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        let tls = match &settings.tls {
            None => None,
            Some(tls_settings) => {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                Some(Arc::new(Tls {
                    connector: connector_builder.build()?,
                    domain_name: tls_settings
                        .domain
                        .clone()
                        .unwrap_or_else(|| settings.host.clone()),
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls,
        })
    }

    /// Replaces the TLS Connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// The broker host connections are opened against.
    pub fn host(&self) -> &str {
        &self.uri.authority.host
    }

    /// Open a new connection to the RabbitMq broker.
    ///
    /// It establishes an encrypted connection if TLS was configured.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.host()))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await??;
        Ok(connection)
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then a TLS handshake expecting our own server domain.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            properties,
        )
        .await
    }
}
