//! The correction service main loop.
//!
//! A single task multiplexes three sources with `tokio::select!`:
//! - the shutdown signal
//! - the MQTT event loop (connect acknowledgements and correction messages)
//! - raw receiver output (UBX capture and NMEA position fixes)
//!
//! Decisions come from [`CorrectionState`]; this module only carries out the
//! resulting [`Action`]s.

use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::Credentials;
use crate::corrections::{Action, CorrectionState};
use crate::gnss::{GnssEndpoint, GnssLink};
use crate::mqtt::{self, MqttError, MqttSession};
use crate::nmea::{is_gga, Gga, NmeaParser};

/// Delay between attempts to reach the receiver.
pub const RECEIVER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Longest a correction write may block before the receiver is dropped.
/// Covers an AssistNow burst over a slow UART.
pub const RECEIVER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 1024;

/// Correction feed settings; absent in monitor-only mode.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub credentials: Credentials,
    pub ca_file: PathBuf,
}

/// Everything the service needs besides the topic state.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub gnss: GnssEndpoint,
    pub ubx_file: Option<PathBuf>,
    pub mqtt: Option<MqttSettings>,
    /// Bound on each write to the receiver, so a stalled receiver cannot
    /// starve the MQTT keep-alive
    pub write_timeout: Duration,
}

/// Errors that stop the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error("UBX file {path}: {source}")]
    Ubx {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

enum Step {
    Shutdown,
    Mqtt(Result<Event, ConnectionError>),
    Read(std::io::Result<usize>),
    RetryReceiver,
}

/// Long-running bridge between the PointPerfect broker and the receiver.
pub struct CorrectionService {
    settings: ServiceSettings,
    state: CorrectionState,
    parser: NmeaParser,
    receiver: Option<GnssLink>,
    retry_at: Instant,
}

impl CorrectionService {
    pub fn new(settings: ServiceSettings, state: CorrectionState) -> Self {
        Self {
            settings,
            state,
            parser: NmeaParser::new(),
            receiver: None,
            retry_at: Instant::now(),
        }
    }

    /// Use an already connected receiver instead of opening the endpoint.
    pub fn with_receiver(mut self, link: GnssLink) -> Self {
        self.receiver = Some(link);
        self
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Result<(), ServiceError> {
        let mut ubx = match &self.settings.ubx_file {
            Some(path) => {
                log::info!("Writing all receiver data to {}", path.display());
                let file = tokio::fs::File::create(path)
                    .await
                    .map_err(|source| ServiceError::Ubx {
                        path: path.clone(),
                        source,
                    })?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        let (ca, mut session) = match &self.settings.mqtt {
            Some(mqtt_settings) => {
                let ca = mqtt::load_ca(&mqtt_settings.ca_file)?;
                let session =
                    MqttSession::new(&mqtt_settings.credentials, self.state.server(), &ca);
                (ca, Some(session))
            }
            None => {
                log::warn!("No MQTT credentials, running without corrections");
                (Vec::new(), None)
            }
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                event = poll_session(session.as_mut()) => Step::Mqtt(event),
                read = read_receiver(self.receiver.as_mut(), &mut buf) => Step::Read(read),
                _ = tokio::time::sleep_until(self.retry_at), if self.receiver.is_none() => {
                    Step::RetryReceiver
                }
            };

            match step {
                Step::Shutdown => break,
                Step::Mqtt(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        if let Some(s) = &session {
                            log::info!("Connected to {}", s.server());
                        }
                        let actions = self.state.on_connected();
                        self.apply(actions, &mut session, &ca).await;
                    } else {
                        log::error!("Failed to connect, return code {:?}", ack.code);
                    }
                }
                Step::Mqtt(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let actions = self.state.on_message(&publish.topic, &publish.payload);
                    self.apply(actions, &mut session, &ca).await;
                }
                Step::Mqtt(Ok(event)) => {
                    log::trace!("MQTT event: {:?}", event);
                }
                Step::Mqtt(Err(e)) => {
                    log::warn!("MQTT connection failed, retrying ... ({})", e);
                }
                Step::Read(Ok(0)) => {
                    log::warn!("Receiver closed the connection");
                    self.drop_receiver();
                }
                Step::Read(Ok(n)) => {
                    let data = &buf[..n];
                    if let Some(writer) = ubx.as_mut() {
                        write_ubx(writer, data, &self.settings.ubx_file).await?;
                    }
                    for sentence in self.parser.push(data) {
                        if !is_gga(&sentence) {
                            continue;
                        }
                        log::info!("{}", sentence);
                        if let Some(gga) = Gga::parse(&sentence) {
                            let actions = self.state.on_gga(&gga);
                            self.apply(actions, &mut session, &ca).await;
                        }
                    }
                }
                Step::Read(Err(e)) => {
                    log::warn!("Receiver read failed: {}", e);
                    self.drop_receiver();
                }
                Step::RetryReceiver => match GnssLink::connect(&self.settings.gnss).await {
                    Ok(link) => {
                        log::info!("Connected to receiver at {}", self.settings.gnss);
                        self.receiver = Some(link);
                    }
                    Err(e) => {
                        log::warn!(
                            "Receiver {} unavailable, retrying ... ({})",
                            self.settings.gnss,
                            e
                        );
                        self.retry_at = Instant::now() + RECEIVER_RETRY_DELAY;
                    }
                },
            }
        }

        if let Some(session) = session.take() {
            session.close().await;
        }
        if let Some(mut writer) = ubx {
            writer.flush().await.map_err(|source| ServiceError::Ubx {
                path: self.settings.ubx_file.clone().unwrap_or_default(),
                source,
            })?;
        }
        log::info!("Correction service stopped");
        Ok(())
    }

    async fn apply(&mut self, actions: Vec<Action>, session: &mut Option<MqttSession>, ca: &[u8]) {
        for action in actions {
            match action {
                Action::Forward(payload) => self.forward(&payload).await,
                Action::Subscribe { topic, qos } => match session.as_ref() {
                    Some(s) => {
                        log::info!("Subscribing to {}", topic);
                        if let Err(e) = s.subscribe(&topic, qos) {
                            log::error!("Failed to subscribe to {}: {}", topic, e);
                        }
                    }
                    None => log::debug!("No MQTT session, not subscribing to {}", topic),
                },
                Action::Unsubscribe { topic } => {
                    if let Some(s) = session.as_ref() {
                        log::info!("Unsubscribing from {}", topic);
                        if let Err(e) = s.unsubscribe(&topic) {
                            log::error!("Failed to unsubscribe from {}: {}", topic, e);
                        }
                    }
                }
                Action::SwitchServer { endpoint } => {
                    let Some(mqtt_settings) = self.settings.mqtt.as_ref() else {
                        continue;
                    };
                    if let Some(old) = session.take() {
                        old.close().await;
                    }
                    *session = Some(MqttSession::new(&mqtt_settings.credentials, &endpoint, ca));
                }
            }
        }
    }

    async fn forward(&mut self, payload: &[u8]) {
        let Some(link) = self.receiver.as_mut() else {
            log::debug!("Receiver not connected, dropping {} bytes", payload.len());
            return;
        };
        let written = async {
            link.writer.write_all(payload).await?;
            link.writer.flush().await
        };
        match tokio::time::timeout(self.settings.write_timeout, written).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Receiver write failed: {}", e);
                self.drop_receiver();
            }
            Err(_) => {
                log::warn!(
                    "Receiver not accepting data for {:?}, dropping {} bytes",
                    self.settings.write_timeout,
                    payload.len()
                );
                self.drop_receiver();
            }
        }
    }

    fn drop_receiver(&mut self) {
        self.receiver = None;
        self.retry_at = Instant::now() + RECEIVER_RETRY_DELAY;
    }
}

async fn poll_session(session: Option<&mut MqttSession>) -> Result<Event, ConnectionError> {
    match session {
        Some(session) => session.poll().await,
        None => std::future::pending().await,
    }
}

async fn read_receiver(link: Option<&mut GnssLink>, buf: &mut [u8]) -> std::io::Result<usize> {
    match link {
        Some(link) => link.reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_ubx(
    writer: &mut BufWriter<tokio::fs::File>,
    data: &[u8],
    path: &Option<PathBuf>,
) -> Result<(), ServiceError> {
    writer
        .write_all(data)
        .await
        .map_err(|source| ServiceError::Ubx {
            path: path.clone().unwrap_or_default(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrections::CorrectionSettings;

    const GGA: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";

    fn settings(ubx_file: Option<PathBuf>) -> ServiceSettings {
        ServiceSettings {
            gnss: GnssEndpoint::Tcp("127.0.0.1:9".into()),
            ubx_file,
            mqtt: None,
            write_timeout: RECEIVER_WRITE_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn test_monitor_only_captures_ubx_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let ubx_path = dir.path().join("capture.ubx");
        let (mut receiver, service_side) = tokio::io::duplex(4096);

        let state = CorrectionState::new(CorrectionSettings::default(), "pp.services.u-blox.com");
        let service = CorrectionService::new(settings(Some(ubx_path.clone())), state)
            .with_receiver(GnssLink::from_stream(service_side));

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(service.run(shutdown_rx));

        let mut sent = vec![0xb5, 0x62, 0x01, 0x07];
        sent.extend_from_slice(GGA);
        receiver.write_all(&sent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(std::fs::read(&ubx_path).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_stops_while_receiver_unreachable() {
        let state = CorrectionState::new(CorrectionSettings::default(), "pp.services.u-blox.com");
        let service = CorrectionService::new(settings(None), state);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(service.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_ca_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(None);
        settings.mqtt = Some(MqttSettings {
            credentials: Credentials {
                client_id: "dev".into(),
                server: "pp.services.u-blox.com".into(),
                port: 8883,
                cert_pem: Vec::new(),
                key_pem: Vec::new(),
                lband: false,
            },
            ca_file: dir.path().join("missing.pem"),
        });
        let state = CorrectionState::new(CorrectionSettings::default(), "pp.services.u-blox.com");

        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let err = CorrectionService::new(settings, state)
            .run(shutdown_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Mqtt(MqttError::CaBundle { .. })));
    }

    #[tokio::test]
    async fn test_stalled_receiver_is_dropped() {
        let (_receiver, service_side) = tokio::io::duplex(16);
        let mut settings = settings(None);
        settings.write_timeout = Duration::from_millis(50);

        let state = CorrectionState::new(CorrectionSettings::default(), "pp.services.u-blox.com");
        let mut service = CorrectionService::new(settings, state)
            .with_receiver(GnssLink::from_stream(service_side));

        tokio::time::timeout(Duration::from_secs(5), service.forward(&[0u8; 1024]))
            .await
            .unwrap();
        assert!(service.receiver.is_none());
        assert!(service.retry_at > Instant::now());
    }
}
