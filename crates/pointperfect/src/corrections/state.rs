use rumqttc::QoS;
use serde::Deserialize;

use super::geo::{self, EARTH_CIRCUMFERENCE, REGIONS};
use super::stats::FixStats;
use super::{Action, ASSIST_NOW_TOPIC, ASSIST_NOW_UPDATES_TOPIC, STATS_TARGET, UBX_TOPIC_PREFIX};
use crate::nmea::Gga;

/// Service options that shape topic selection.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionSettings {
    /// Use the localized (tile/node) service instead of continental streams
    pub localized: bool,
    /// L-band+IP plan topics (`Lb`) instead of IP-only (`ip`)
    pub lband: bool,
    /// Fixed continental region; detected from the position when unset
    pub region: Option<String>,
    /// Localized tile level, 0..=2
    pub tile_level: u8,
    /// Localized: distance in meters that triggers tile/node re-selection
    pub distance: u32,
    /// Localized: maximum epochs between re-selections (unlimited if unset)
    pub epochs: Option<u64>,
    /// Keep AssistNow subscribed whatever the fix quality
    pub assist_now: bool,
    /// Log fix statistics every N epochs
    pub stats_interval: Option<u32>,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            localized: false,
            lband: false,
            region: None,
            tile_level: 2,
            distance: 50_000,
            epochs: None,
            assist_now: false,
            stats_interval: None,
        }
    }
}

/// Tile dictionary published on `pp/ip/<tile>/dict`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TileDict {
    pub nodes: Vec<String>,
    pub nodeprefix: String,
    pub endpoint: String,
}

/// Topic selection state for one correction session.
#[derive(Debug)]
pub struct CorrectionState {
    settings: CorrectionSettings,
    plan: &'static str,
    server: String,
    key_topics: Vec<(String, QoS)>,
    spartn_topic: Option<String>,
    tile_topic: Option<String>,
    assist_now_topic: Option<String>,
    tile: Option<TileDict>,
    // position at the last node selection
    lat: f64,
    lon: f64,
    epoch_count: u64,
    dlat_threshold: f64,
    dlon_threshold: f64,
    stats: Option<FixStats>,
}

impl CorrectionState {
    pub fn new(settings: CorrectionSettings, server: impl Into<String>) -> Self {
        let plan = if settings.lband { "Lb" } else { "ip" };

        let mut key_topics = Vec::new();
        let mut spartn_topic = None;
        if !settings.localized {
            key_topics.push((format!("{UBX_TOPIC_PREFIX}0236/{plan}"), QoS::AtLeastOnce));
            if let Some(region) = &settings.region {
                spartn_topic = Some(format!("/pp/{plan}/{region}"));
            }
        }

        Self {
            plan,
            server: server.into(),
            key_topics,
            spartn_topic,
            tile_topic: None,
            assist_now_topic: settings.assist_now.then(|| ASSIST_NOW_TOPIC.to_string()),
            tile: None,
            lat: 0.0,
            lon: 0.0,
            epoch_count: 0,
            dlat_threshold: f64::from(settings.distance) * 360.0 / EARTH_CIRCUMFERENCE,
            dlon_threshold: 0.0,
            stats: settings.stats_interval.map(FixStats::new),
            settings,
        }
    }

    /// Broker the session should be connected to.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn plan(&self) -> &str {
        self.plan
    }

    pub fn spartn_topic(&self) -> Option<&str> {
        self.spartn_topic.as_deref()
    }

    pub fn tile_topic(&self) -> Option<&str> {
        self.tile_topic.as_deref()
    }

    pub fn assist_now_topic(&self) -> Option<&str> {
        self.assist_now_topic.as_deref()
    }

    /// Subscriptions to (re)establish after a successful connect.
    pub fn on_connected(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .key_topics
            .iter()
            .map(|(topic, qos)| Action::subscribe(topic.clone(), *qos))
            .collect();

        if let Some(topic) = &self.spartn_topic {
            actions.push(Action::subscribe(topic.clone(), QoS::AtMostOnce));
        }
        if let Some(topic) = &self.assist_now_topic {
            let qos = if topic.ends_with("/updates") {
                QoS::AtMostOnce
            } else {
                QoS::AtLeastOnce
            };
            actions.push(Action::subscribe(topic.clone(), qos));
        }
        actions
    }

    /// Route a message received from the broker.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Vec<Action> {
        if topic.starts_with(&format!("/pp/{}/", self.plan)) {
            // regional SPARTN
            return vec![Action::Forward(payload.to_vec())];
        }

        if topic.starts_with(UBX_TOPIC_PREFIX) {
            // SPARTN key or AssistNow data
            let mut actions = vec![Action::Forward(payload.to_vec())];
            if topic == ASSIST_NOW_TOPIC {
                actions.push(Action::unsubscribe(ASSIST_NOW_TOPIC));
                self.assist_now_topic = Some(ASSIST_NOW_UPDATES_TOPIC.to_string());
                actions.push(Action::subscribe(ASSIST_NOW_UPDATES_TOPIC, QoS::AtMostOnce));
            }
            return actions;
        }

        if topic.starts_with("pp/ip") {
            if topic.ends_with("/dict") {
                return self.on_tile_data(payload);
            }
            // localized SPARTN
            return vec![Action::Forward(payload.to_vec())];
        }

        log::warn!("Unhandled topic {}", topic);
        Vec::new()
    }

    /// Handle a position fix from the receiver.
    pub fn on_gga(&mut self, gga: &Gga) -> Vec<Action> {
        if let Some(stats) = self.stats.as_mut() {
            if let Some(line) = stats.record(gga.quality) {
                log::info!(target: STATS_TARGET, "{}", line);
            }
        }

        // no fix or dead reckoning only
        if gga.quality == 0 || gga.quality == 6 {
            if self.assist_now_topic.is_none() {
                self.assist_now_topic = Some(ASSIST_NOW_TOPIC.to_string());
                return vec![Action::subscribe(ASSIST_NOW_TOPIC, QoS::AtLeastOnce)];
            }
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.settings.assist_now {
            if let Some(topic) = self.assist_now_topic.take() {
                actions.push(Action::unsubscribe(topic));
            }
        }
        actions.extend(self.process_position(gga.lat, gga.lon));
        actions
    }

    fn process_position(&mut self, lat: f64, lon: f64) -> Vec<Action> {
        if !self.settings.localized {
            if self.spartn_topic.is_some() {
                return Vec::new();
            }
            log::debug!("updating position: {:.6}, {:.6}", lat, lon);
            self.lat = lat;
            self.lon = lon;
            // regional mode selects among the continental centres
            self.tile = Some(TileDict {
                nodes: REGIONS.iter().map(|(node, _)| node.to_string()).collect(),
                nodeprefix: format!("/pp/{}/", self.plan),
                endpoint: self.server.clone(),
            });
            return self.select_node();
        }

        self.epoch_count += 1;
        let moved = (lat - self.lat).abs() > self.dlat_threshold
            || (lon - self.lon).abs() > self.dlon_threshold;
        let expired = self
            .settings
            .epochs
            .is_some_and(|limit| self.epoch_count > limit);
        if !moved && !expired {
            return Vec::new();
        }

        log::debug!("updating position: {:.6}, {:.6}", lat, lon);
        self.lat = lat;
        self.lon = lon;
        self.epoch_count = 0;
        self.dlon_threshold = self.dlat_threshold * self.lat.to_radians().cos();

        let topic = geo::tile_topic(self.settings.tile_level, lat, lon);
        if self.tile_topic.as_deref() == Some(topic.as_str()) {
            return self.select_node();
        }

        let mut actions = Vec::new();
        if let Some(old) = self.tile_topic.take() {
            actions.push(Action::unsubscribe(old));
        }
        log::debug!("Tile changed to {}", topic);
        actions.push(Action::subscribe(topic.clone(), QoS::AtLeastOnce));
        self.tile_topic = Some(topic);
        // node selection happens when the tile dictionary arrives
        actions
    }

    fn on_tile_data(&mut self, payload: &[u8]) -> Vec<Action> {
        match serde_json::from_slice::<TileDict>(payload) {
            Ok(tile) => {
                self.tile = Some(tile);
                self.select_node()
            }
            Err(e) => {
                log::error!("Invalid JSON data received for tile: {}", e);
                Vec::new()
            }
        }
    }

    fn select_node(&mut self) -> Vec<Action> {
        let Some(tile) = self.tile.as_ref() else {
            return Vec::new();
        };
        let nodes = tile.nodes.iter().map(String::as_str);
        let Some(nearest) = geo::nearest_node(self.lat, self.lon, nodes) else {
            log::warn!("Tile contains no usable nodes");
            return Vec::new();
        };

        let node = if self.settings.localized {
            log::debug!("Nearest node: {}", nearest);
            nearest.to_string()
        } else {
            let Some(region) = geo::region_for_node(nearest) else {
                return Vec::new();
            };
            log::warn!("Region \"{}\" automatically detected", region);
            region.to_string()
        };

        let topic = format!("{}{}", tile.nodeprefix, node);
        if tile.endpoint != self.server {
            // subscribed on connect to the new broker
            let endpoint = tile.endpoint.clone();
            self.spartn_topic = Some(topic);
            self.server = endpoint.clone();
            return vec![Action::SwitchServer { endpoint }];
        }

        if self.spartn_topic.as_deref() == Some(topic.as_str()) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(old) = self.spartn_topic.take() {
            actions.push(Action::unsubscribe(old));
        }
        actions.push(Action::subscribe(topic.clone(), QoS::AtMostOnce));
        self.spartn_topic = Some(topic);
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "pp.services.u-blox.com";

    fn fix(quality: u8, lat: f64, lon: f64) -> Gga {
        Gga { quality, lat, lon }
    }

    fn localized() -> CorrectionSettings {
        CorrectionSettings {
            localized: true,
            ..Default::default()
        }
    }

    fn tile_json(endpoint: &str) -> Vec<u8> {
        serde_json::json!({
            "nodes": ["N5125E00375", "N5200E00500"],
            "nodeprefix": "pp/ip/L2N5125E00375/",
            "endpoint": endpoint,
            "tile": "L2N5125E00375",
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_fixed_region_subscriptions() {
        let state = CorrectionState::new(
            CorrectionSettings {
                region: Some("eu".into()),
                ..Default::default()
            },
            SERVER,
        );

        assert_eq!(
            state.on_connected(),
            vec![
                Action::subscribe("/pp/ubx/0236/ip", QoS::AtLeastOnce),
                Action::subscribe("/pp/ip/eu", QoS::AtMostOnce),
            ]
        );
    }

    #[test]
    fn test_lband_plan_topics() {
        let mut state = CorrectionState::new(
            CorrectionSettings {
                lband: true,
                region: Some("us".into()),
                ..Default::default()
            },
            SERVER,
        );

        assert_eq!(state.plan(), "Lb");
        assert_eq!(state.spartn_topic(), Some("/pp/Lb/us"));
        assert_eq!(
            state.on_message("/pp/Lb/us", b"spartn"),
            vec![Action::Forward(b"spartn".to_vec())]
        );
    }

    #[test]
    fn test_region_detected_once() {
        let mut state = CorrectionState::new(CorrectionSettings::default(), SERVER);

        let actions = state.on_gga(&fix(1, 48.14, 11.58));
        assert_eq!(actions, vec![Action::subscribe("/pp/ip/eu", QoS::AtMostOnce)]);
        assert_eq!(state.spartn_topic(), Some("/pp/ip/eu"));

        // later fixes keep the detected region
        assert!(state.on_gga(&fix(4, 37.57, 126.98)).is_empty());
    }

    #[test]
    fn test_assist_now_lifecycle() {
        let mut state = CorrectionState::new(
            CorrectionSettings {
                region: Some("eu".into()),
                ..Default::default()
            },
            SERVER,
        );

        // no fix: request AssistNow once
        assert_eq!(
            state.on_gga(&fix(0, 0.0, 0.0)),
            vec![Action::subscribe(ASSIST_NOW_TOPIC, QoS::AtLeastOnce)]
        );
        assert!(state.on_gga(&fix(6, 0.0, 0.0)).is_empty());

        // first AssistNow message switches to the update stream
        assert_eq!(
            state.on_message(ASSIST_NOW_TOPIC, b"mga"),
            vec![
                Action::Forward(b"mga".to_vec()),
                Action::unsubscribe(ASSIST_NOW_TOPIC),
                Action::subscribe(ASSIST_NOW_UPDATES_TOPIC, QoS::AtMostOnce),
            ]
        );
        assert_eq!(state.assist_now_topic(), Some(ASSIST_NOW_UPDATES_TOPIC));

        // a fix drops AssistNow again
        assert_eq!(
            state.on_gga(&fix(1, 48.14, 11.58)),
            vec![Action::unsubscribe(ASSIST_NOW_UPDATES_TOPIC)]
        );
        assert_eq!(state.assist_now_topic(), None);
    }

    #[test]
    fn test_forced_assist_now_stays_subscribed() {
        let mut state = CorrectionState::new(
            CorrectionSettings {
                region: Some("eu".into()),
                assist_now: true,
                ..Default::default()
            },
            SERVER,
        );

        assert!(state
            .on_connected()
            .contains(&Action::subscribe(ASSIST_NOW_TOPIC, QoS::AtLeastOnce)));
        assert!(state.on_gga(&fix(4, 48.14, 11.58)).is_empty());
        assert_eq!(state.assist_now_topic(), Some(ASSIST_NOW_TOPIC));
    }

    #[test]
    fn test_localized_tile_and_node_selection() {
        let mut state = CorrectionState::new(localized(), SERVER);
        assert!(state.on_connected().is_empty());

        let actions = state.on_gga(&fix(1, 52.3, 4.9));
        assert_eq!(
            actions,
            vec![Action::subscribe("pp/ip/L2N5125E00375/dict", QoS::AtLeastOnce)]
        );

        let actions = state.on_message("pp/ip/L2N5125E00375/dict", &tile_json(SERVER));
        assert_eq!(
            actions,
            vec![Action::subscribe(
                "pp/ip/L2N5125E00375/N5200E00500",
                QoS::AtMostOnce
            )]
        );

        // localized SPARTN goes to the receiver
        assert_eq!(
            state.on_message("pp/ip/L2N5125E00375/N5200E00500", b"data"),
            vec![Action::Forward(b"data".to_vec())]
        );
    }

    #[test]
    fn test_localized_small_moves_are_ignored() {
        let mut state = CorrectionState::new(localized(), SERVER);
        state.on_gga(&fix(1, 52.3, 4.9));
        state.on_message("pp/ip/L2N5125E00375/dict", &tile_json(SERVER));

        assert!(state.on_gga(&fix(1, 52.31, 4.91)).is_empty());
    }

    #[test]
    fn test_localized_tile_change() {
        let mut state = CorrectionState::new(localized(), SERVER);
        state.on_gga(&fix(1, 52.3, 4.9));

        let actions = state.on_gga(&fix(1, 48.14, 11.58));
        assert_eq!(
            actions,
            vec![
                Action::unsubscribe("pp/ip/L2N5125E00375/dict"),
                Action::subscribe("pp/ip/L2N4875E01125/dict", QoS::AtLeastOnce),
            ]
        );
        assert_eq!(state.tile_topic(), Some("pp/ip/L2N4875E01125/dict"));
    }

    #[test]
    fn test_localized_epoch_limit_reselects() {
        let mut state = CorrectionState::new(
            CorrectionSettings {
                epochs: Some(2),
                ..localized()
            },
            SERVER,
        );
        state.on_gga(&fix(1, 52.3, 4.9));
        state.on_message("pp/ip/L2N5125E00375/dict", &tile_json(SERVER));

        assert!(state.on_gga(&fix(1, 52.3, 4.9)).is_empty());
        assert!(state.on_gga(&fix(1, 52.3, 4.9)).is_empty());
        assert_eq!(state.epoch_count, 2);

        // third epoch exceeds the limit; same tile and node, nothing to change
        assert!(state.on_gga(&fix(1, 52.31, 4.9)).is_empty());
        assert_eq!(state.epoch_count, 0);
        assert_eq!(state.lat, 52.31);
        assert_eq!(state.spartn_topic(), Some("pp/ip/L2N5125E00375/N5200E00500"));
    }

    #[test]
    fn test_node_on_other_server_switches() {
        let mut state = CorrectionState::new(localized(), SERVER);
        state.on_gga(&fix(1, 52.3, 4.9));

        let tile = tile_json("pp-eu.example.com");
        let actions = state.on_message("pp/ip/L2N5125E00375/dict", &tile);
        assert_eq!(
            actions,
            vec![Action::SwitchServer {
                endpoint: "pp-eu.example.com".into()
            }]
        );
        assert_eq!(state.server(), "pp-eu.example.com");
        assert_eq!(
            state.on_connected(),
            vec![Action::subscribe(
                "pp/ip/L2N5125E00375/N5200E00500",
                QoS::AtMostOnce
            )]
        );
    }

    #[test]
    fn test_invalid_tile_data_is_dropped() {
        let mut state = CorrectionState::new(localized(), SERVER);
        state.on_gga(&fix(1, 52.3, 4.9));

        assert!(state
            .on_message("pp/ip/L2N5125E00375/dict", b"{not json")
            .is_empty());
        assert_eq!(state.spartn_topic(), None);
    }

    #[test]
    fn test_key_topic_forwarded() {
        let mut state = CorrectionState::new(CorrectionSettings::default(), SERVER);
        assert_eq!(
            state.on_message("/pp/ubx/0236/ip", b"key"),
            vec![Action::Forward(b"key".to_vec())]
        );
    }

    #[test]
    fn test_unknown_topic_ignored() {
        let mut state = CorrectionState::new(CorrectionSettings::default(), SERVER);
        assert!(state.on_message("/other/topic", b"x").is_empty());
    }
}
