//! PointPerfect correction client.
//!
//! Subscribes to u-blox PointPerfect SPARTN correction streams over MQTT
//! and forwards them to a GNSS receiver, choosing regional or localized
//! topics from the receiver's own NMEA position reports.
//!
//! - [`launch`]: startup sequence from parsed [`Args`] to a running service
//! - [`config`]: u-center JSON configuration and MQTT credentials
//! - [`corrections`]: topic selection state machine
//! - [`service`]: the I/O loop tying broker and receiver together

pub mod cli;
pub mod config;
pub mod corrections;
pub mod gnss;
pub mod launch;
pub mod logging;
pub mod mqtt;
pub mod nmea;
pub mod service;

pub use cli::Args;
pub use config::{Config, ConfigurationError, Credentials};
pub use corrections::{Action, CorrectionSettings, CorrectionState};
pub use gnss::{GnssEndpoint, GnssLink};
pub use launch::{prepare, Launch, LaunchError};
pub use service::{CorrectionService, ServiceError, ServiceSettings};
