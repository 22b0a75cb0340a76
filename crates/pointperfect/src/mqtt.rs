//! MQTT session to the PointPerfect broker.

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, QoS,
    TlsConfiguration, Transport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Credentials;

/// CA bundle used when nothing else is configured.
pub const DEFAULT_CA_FILE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Environment override for the CA bundle.
pub const CA_FILE_ENV: &str = "SSL_CERT_FILE";

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Delay before the event loop is polled again after a connection error.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Read the CA bundle that verifies the broker certificate.
pub fn load_ca(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::CaBundle {
        path: path.to_path_buf(),
        source,
    })
}

/// Client options for a broker: TLS with client certificate authentication.
pub fn mqtt_options(credentials: &Credentials, server: &str, ca: &[u8]) -> MqttOptions {
    let mut options = MqttOptions::new(credentials.client_id.clone(), server, credentials.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca: ca.to_vec(),
        alpn: None,
        client_auth: Some((credentials.cert_pem.clone(), credentials.key_pem.clone())),
    }));
    options
}

/// One broker connection: request handle plus its event loop.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    server: String,
    backoff: Option<Instant>,
}

impl MqttSession {
    pub fn new(credentials: &Credentials, server: &str, ca: &[u8]) -> Self {
        log::info!("Connecting to {}", server);
        let (client, eventloop) =
            AsyncClient::new(mqtt_options(credentials, server, ca), REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            server: server.to_string(),
            backoff: None,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Drive the connection. Cancel safe; after an error the next poll waits
    /// [`RETRY_DELAY`] before reconnecting.
    pub async fn poll(&mut self) -> Result<Event, ConnectionError> {
        if let Some(at) = self.backoff {
            tokio::time::sleep_until(at).await;
            self.backoff = None;
        }
        let result = self.eventloop.poll().await;
        if result.is_err() {
            self.backoff = Some(Instant::now() + RETRY_DELAY);
        }
        result
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.client.try_subscribe(topic, qos)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.try_unsubscribe(topic)
    }

    /// Send a DISCONNECT and give the event loop a moment to flush it.
    pub async fn close(mut self) {
        log::info!("Disconnecting from {}", self.server);
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
            log::debug!("Timed out flushing disconnect to {}", self.server);
        }
    }
}

/// MQTT setup errors.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
