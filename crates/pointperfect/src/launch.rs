//! Startup sequence: validate arguments, load configuration, resolve
//! credentials and endpoints, then hand off to the correction service.

use std::path::PathBuf;
use tokio::sync::watch;

use crate::cli::Args;
use crate::config::{Config, ConfigurationError, Credentials, DEFAULT_SERVER};
use crate::corrections::{CorrectionSettings, CorrectionState};
use crate::gnss::{GnssEndpoint, DEFAULT_GNSS_ENDPOINT, GNSS_ENDPOINT_ENV};
use crate::mqtt::{CA_FILE_ENV, DEFAULT_CA_FILE};
use crate::service::{
    CorrectionService, MqttSettings, ServiceError, ServiceSettings, RECEIVER_WRITE_TIMEOUT,
};

/// Errors that prevent the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Invalid combination of command-line options
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to read credentials for {client_id}: {source}")]
    Credentials {
        client_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Usage(_) => 2,
            LaunchError::Configuration(_) | LaunchError::Credentials { .. } => 1,
        }
    }
}

/// A fully resolved launch, ready to run.
#[derive(Debug)]
pub struct Launch {
    /// The loaded configuration document, if `-j` was given
    pub config: Option<Config>,
    pub corrections: CorrectionSettings,
    pub service: ServiceSettings,
    /// Initial MQTT broker
    pub server: String,
}

impl Launch {
    /// True when no credentials are available and only the receiver is monitored.
    pub fn is_monitor_only(&self) -> bool {
        self.service.mqtt.is_none()
    }

    /// Run the correction service until `shutdown` fires.
    pub async fn run(self, shutdown: watch::Receiver<()>) -> Result<(), ServiceError> {
        let state = CorrectionState::new(self.corrections, self.server);
        CorrectionService::new(self.service, state)
            .run(shutdown)
            .await
    }
}

/// Resolve everything needed to start. Does no network I/O.
pub fn prepare(args: &Args) -> Result<Launch, LaunchError> {
    args.validate().map_err(LaunchError::Usage)?;

    let config = match &args.json {
        Some(path) => {
            log::debug!("Loading configuration from {}", path.display());
            Some(Config::from_file(path)?)
        }
        None => None,
    };

    let credentials = match (&config, &args.client_id) {
        (Some(config), _) => match &config.mqtt {
            Some(mqtt) => Some(Credentials::from_section(mqtt)?),
            None => None,
        },
        (None, Some(client_id)) => Some(credentials_from_dir(args, client_id)?),
        (None, None) => {
            return Err(LaunchError::Usage(
                "Either -j/--json or -i/--client-id must be specified".to_string(),
            ))
        }
    };

    let server = credentials
        .as_ref()
        .map_or_else(|| DEFAULT_SERVER.to_string(), |c| c.server.clone());

    let corrections = CorrectionSettings {
        localized: args.localized,
        lband: credentials.as_ref().is_some_and(|c| c.lband) || args.lband,
        region: args.region.clone(),
        tile_level: args.tile_level.unwrap_or(2),
        distance: args.distance.unwrap_or(50_000),
        epochs: args.epochs,
        assist_now: args.assistnow,
        stats_interval: args.stats,
    };

    let gnss = resolve_gnss_endpoint(
        args.gnss.as_ref(),
        config.as_ref(),
        std::env::var(GNSS_ENDPOINT_ENV).ok(),
    )?;

    let mqtt = credentials.map(|credentials| MqttSettings {
        credentials,
        ca_file: resolve_ca_file(
            args.ca_file.as_ref(),
            config.as_ref(),
            std::env::var(CA_FILE_ENV).ok(),
        ),
    });

    Ok(Launch {
        config,
        corrections,
        service: ServiceSettings {
            gnss,
            ubx_file: args.ubx.clone(),
            mqtt,
            write_timeout: RECEIVER_WRITE_TIMEOUT,
        },
        server,
    })
}

fn credentials_from_dir(args: &Args, client_id: &str) -> Result<Credentials, LaunchError> {
    let dir = args.dir_or_default();
    for file in [
        Credentials::cert_file(&dir, client_id),
        Credentials::key_file(&dir, client_id),
    ] {
        if !file.exists() {
            return Err(LaunchError::Usage(format!(
                "{} does not exist",
                file.display()
            )));
        }
    }

    Credentials::from_dir(&dir, client_id, args.server_or_default(), args.lband).map_err(
        |source| LaunchError::Credentials {
            client_id: client_id.to_string(),
            source,
        },
    )
}

/// Receiver endpoint: command line, then configuration, then environment.
pub fn resolve_gnss_endpoint(
    cli: Option<&GnssEndpoint>,
    config: Option<&Config>,
    env: Option<String>,
) -> Result<GnssEndpoint, LaunchError> {
    if let Some(endpoint) = cli {
        return Ok(endpoint.clone());
    }
    if let Some(endpoint) = config.and_then(Config::gnss_endpoint) {
        return endpoint.parse().map_err(|reason| {
            LaunchError::Configuration(ConfigurationError::Invalid {
                origin: "gnss.endpoint".to_string(),
                reason,
            })
        });
    }
    if let Some(endpoint) = env {
        return endpoint
            .parse()
            .map_err(|e| LaunchError::Usage(format!("{}: {}", GNSS_ENDPOINT_ENV, e)));
    }
    DEFAULT_GNSS_ENDPOINT.parse().map_err(LaunchError::Usage)
}

/// CA bundle: command line, then configuration, then environment.
pub fn resolve_ca_file(
    cli: Option<&PathBuf>,
    config: Option<&Config>,
    env: Option<String>,
) -> PathBuf {
    cli.cloned()
        .or_else(|| config.and_then(Config::ca_file).map(PathBuf::from))
        .or_else(|| env.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_FILE))
}
