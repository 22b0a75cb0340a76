//! Correction stream selection.
//!
//! [`CorrectionState`] decides which PointPerfect topics to follow based on
//! the receiver's position and the messages arriving from the broker. It does
//! no I/O; every decision comes back as a list of [`Action`]s for the service
//! loop to carry out.

pub mod geo;
mod state;
mod stats;

pub use state::{CorrectionSettings, CorrectionState, TileDict};
pub use stats::{FixStats, QUALITIES};

use rumqttc::QoS;

/// Log target for statistics lines; always enabled regardless of level.
pub const STATS_TARGET: &str = "pointperfect::stats";

/// Topic prefix of SPARTN keys and AssistNow data.
pub const UBX_TOPIC_PREFIX: &str = "/pp/ubx/";

/// Initial AssistNow topic, replaced by [`ASSIST_NOW_UPDATES_TOPIC`] after
/// the first message.
pub const ASSIST_NOW_TOPIC: &str = "/pp/ubx/mga";
pub const ASSIST_NOW_UPDATES_TOPIC: &str = "/pp/ubx/mga/updates";

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    /// Write raw correction data to the receiver
    Forward(Vec<u8>),
    /// Reconnect to another broker; subscriptions follow on connect
    SwitchServer { endpoint: String },
}

impl Action {
    pub fn subscribe(topic: impl Into<String>, qos: QoS) -> Self {
        Action::Subscribe {
            topic: topic.into(),
            qos,
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Action::Unsubscribe {
            topic: topic.into(),
        }
    }
}
