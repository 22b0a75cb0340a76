//! Command-line interface for the pointperfect launcher

use argh::FromArgs;
use log::LevelFilter;
use std::path::PathBuf;

use crate::config::DEFAULT_SERVER;
use crate::gnss::GnssEndpoint;
use crate::logging::{effective_level, parse_trace_level, LogOptions};

/// PointPerfect correction client for u-blox GNSS receivers
#[derive(FromArgs, Debug)]
pub struct Args {
    /// u-center JSON file containing MQTT credentials
    #[argh(option, short = 'j')]
    pub json: Option<PathBuf>,

    /// enable verbose logging (debug level)
    #[argh(switch, short = 'l')]
    pub logging: bool,

    /// trace level: CRITICAL, ERROR, WARNING, INFO, DEBUG (default: INFO)
    #[argh(option, default = "LevelFilter::Info", from_str_fn(parse_trace_level))]
    pub trace: LevelFilter,

    /// write all program output to this text file in addition to stdout (path required, e.g. pointperfect_log.txt)
    #[argh(option)]
    pub log_file: Option<PathBuf>,

    /// use AssistNow regardless of GNSS receiver state
    #[argh(switch)]
    pub assistnow: bool,

    /// service region (e.g. us, eu), defaults to automatic detection
    #[argh(option)]
    pub region: Option<String>,

    /// use localized service
    #[argh(switch)]
    pub localized: bool,

    /// write all GNSS receiver output to this UBX file (path required, e.g. pointperfect_log.ubx)
    #[argh(option, short = 'u')]
    pub ubx: Option<PathBuf>,

    /// print statistics every N epochs (value required, 5 is a typical interval)
    #[argh(option)]
    pub stats: Option<u32>,

    /// the MQTT client ID to use (not with -j)
    #[argh(option, short = 'i')]
    pub client_id: Option<String>,

    /// directory containing key and certificate files (default: ., not with -j)
    #[argh(option, short = 'd')]
    pub dir: Option<PathBuf>,

    /// address of the MQTT server (default: pp.services.u-blox.com, not with -j)
    #[argh(option, short = 's')]
    pub server: Option<String>,

    /// use MQTT topics suitable for devices on an Lband+IP combined plan (not with -j)
    #[argh(switch)]
    pub lband: bool,

    /// localized: distance threshold [m] for recalculating tile and node (default: 50000)
    #[argh(option)]
    pub distance: Option<u32>,

    /// localized: maximum number of epochs between recalculating tile and node (default: unlimited)
    #[argh(option)]
    pub epochs: Option<u64>,

    /// localized: tile level 0, 1 or 2 (default: 2)
    #[argh(option, short = 'L')]
    pub tile_level: Option<u8>,

    /// receiver endpoint: tcp://host:port, or a serial port with optional baud rate (/dev/ttyACM0@115200, default 38400)
    #[argh(option, short = 'g')]
    pub gnss: Option<GnssEndpoint>,

    /// path to the CA bundle used to verify the MQTT server
    #[argh(option)]
    pub ca_file: Option<PathBuf>,
}

impl Args {
    /// Logging preferences implied by `-l`, `--trace` and `--log-file`.
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            level: effective_level(self.trace, self.logging),
            log_file: self.log_file.clone(),
        }
    }

    /// Check option combinations that argh cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.localized && self.region.is_some() {
            return Err("--region cannot be used with --localized".to_string());
        }
        if !self.localized {
            if self.distance.is_some() {
                return Err("--distance requires --localized".to_string());
            }
            if self.epochs.is_some() {
                return Err("--epochs requires --localized".to_string());
            }
            if self.tile_level.is_some() {
                return Err("--tile-level requires --localized".to_string());
            }
        }
        if self.tile_level.is_some_and(|level| level > 2) {
            return Err("--tile-level must be 0, 1 or 2".to_string());
        }
        if self.stats == Some(0) {
            return Err("--stats must be at least 1".to_string());
        }

        if self.json.is_some() {
            if self.client_id.is_some() || self.dir.is_some() || self.server.is_some() || self.lband {
                return Err(
                    "Cannot use -j/--json with -i/--client-id, -d/--dir, -s/--server, or --lband"
                        .to_string(),
                );
            }
        } else if self.client_id.is_none() {
            return Err("Either -j/--json or -i/--client-id must be specified".to_string());
        }
        Ok(())
    }

    /// MQTT server for credentials given on the command line.
    pub fn server_or_default(&self) -> &str {
        self.server.as_deref().unwrap_or(DEFAULT_SERVER)
    }

    /// Certificate directory for credentials given on the command line.
    pub fn dir_or_default(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
