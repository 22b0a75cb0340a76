//! Tile and node geometry for the PointPerfect topic layout.

/// Centre points of the continental service regions, keyed by node name.
///
/// Regional mode treats these as the nodes of a single virtual tile, so the
/// nearest one decides the region. The table may lag behind the service; a
/// fixed `--region` always wins.
pub const REGIONS: &[(&str, &str)] = &[
    ("S2655E13470", "au"),
    ("N5245E01185", "eu"),
    ("N3895E13960", "jp"),
    ("N3310E13220", "jp"),
    ("N3630E12820", "kr"),
    ("N3920W09660", "us"),
];

/// Mean earth circumference in meters.
pub const EARTH_CIRCUMFERENCE: f64 = 6_371_000.0 * 2.0 * std::f64::consts::PI;

/// Tile edge length in degrees for each tile level.
const TILE_DELTAS: [f64; 3] = [10.0, 5.0, 2.5];

/// Region name for a node of the [`REGIONS`] table.
pub fn region_for_node(node: &str) -> Option<&'static str> {
    REGIONS
        .iter()
        .find(|(name, _)| *name == node)
        .map(|(_, region)| *region)
}

/// Node coordinates in hundredths of a degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePosition {
    pub lat: i32,
    pub lon: i32,
}

impl NodePosition {
    /// Parse a node name of the form `N5245E01185`.
    pub fn parse(node: &str) -> Option<Self> {
        let bytes = node.as_bytes();
        if bytes.len() != 11 || !node.is_ascii() {
            return None;
        }
        let lat_sign = match bytes[0] {
            b'N' => 1,
            b'S' => -1,
            _ => return None,
        };
        let lon_sign = match bytes[5] {
            b'E' => 1,
            b'W' => -1,
            _ => return None,
        };
        let lat: i32 = node[1..5].parse().ok()?;
        let lon: i32 = node[6..11].parse().ok()?;

        Some(Self {
            lat: lat_sign * lat,
            lon: lon_sign * lon,
        })
    }
}

/// Pick the node closest to the given position.
///
/// Uses a scaled squared distance that only needs to preserve ordering: the
/// longitude difference is scaled by `cos(lat)` to bring it to the latitude
/// scale. Unparseable node names are skipped.
pub fn nearest_node<'a>(
    lat: f64,
    lon: f64,
    nodes: impl IntoIterator<Item = &'a str>,
) -> Option<&'a str> {
    let rounded_lat = (lat * 100.0).round();
    let rounded_lon = (lon * 100.0).round();
    let factor_lon = lat.to_radians().cos();

    let mut nearest: Option<(&str, f64)> = None;
    for node in nodes {
        let Some(position) = NodePosition::parse(node) else {
            log::debug!("Skipping malformed node name {}", node);
            continue;
        };
        let dlat = f64::from(position.lat) - rounded_lat;
        let dlon = (f64::from(position.lon) - rounded_lon) * factor_lon;
        let dist = dlat * dlat + dlon * dlon;
        if nearest.map_or(true, |(_, min)| dist < min) {
            nearest = Some((node, dist));
        }
    }
    nearest.map(|(node, _)| node)
}

/// MQTT topic of the tile dictionary covering a position.
///
/// `level` must be 0, 1 or 2; larger values are clamped to 2.
pub fn tile_topic(level: u8, lat: f64, lon: f64) -> String {
    let level = level.min(2);
    let delta = TILE_DELTAS[usize::from(level)];
    let n_s = if lat < 0.0 { 'S' } else { 'N' };
    let e_w = if lon < 0.0 { 'W' } else { 'E' };

    // centre of the tile containing the position
    let clat = (lat / delta).floor() * delta + delta / 2.0;
    let clon = (lon / delta).floor() * delta + delta / 2.0;

    let slat = (clat * 100.0).round().abs() as u32;
    let slon = (clon * 100.0).round().abs() as u32;
    format!("pp/ip/L{level}{n_s}{slat:04}{e_w}{slon:05}/dict")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_position_parse() {
        assert_eq!(
            NodePosition::parse("S2655E13470"),
            Some(NodePosition {
                lat: -2655,
                lon: 13470
            })
        );
        assert_eq!(
            NodePosition::parse("N3920W09660"),
            Some(NodePosition {
                lat: 3920,
                lon: -9660
            })
        );
        assert_eq!(NodePosition::parse("X3920W09660"), None);
        assert_eq!(NodePosition::parse("N3920W0966"), None);
        assert_eq!(NodePosition::parse("N39A0W09660"), None);
    }

    #[test]
    fn test_nearest_region() {
        let nodes = REGIONS.iter().map(|(node, _)| *node);
        // Munich
        let node = nearest_node(48.14, 11.58, nodes.clone()).unwrap();
        assert_eq!(region_for_node(node), Some("eu"));
        // Sydney
        let node = nearest_node(-33.87, 151.21, nodes.clone()).unwrap();
        assert_eq!(region_for_node(node), Some("au"));
        // Denver
        let node = nearest_node(39.74, -104.99, nodes.clone()).unwrap();
        assert_eq!(region_for_node(node), Some("us"));
        // Seoul
        let node = nearest_node(37.57, 126.98, nodes).unwrap();
        assert_eq!(region_for_node(node), Some("kr"));
    }

    #[test]
    fn test_nearest_node_skips_malformed() {
        let nodes = ["garbage", "N4800E01100", "N5000E01100"];
        assert_eq!(nearest_node(48.1, 11.0, nodes), Some("N4800E01100"));
        assert_eq!(nearest_node(48.1, 11.0, ["garbage"]), None);
    }

    #[test]
    fn test_tile_topic_levels() {
        assert_eq!(tile_topic(2, 52.3, 4.9), "pp/ip/L2N5125E00375/dict");
        assert_eq!(tile_topic(1, 52.3, 4.9), "pp/ip/L1N5250E00250/dict");
        assert_eq!(tile_topic(0, 52.3, 4.9), "pp/ip/L0N5500E00500/dict");
    }

    #[test]
    fn test_tile_topic_southern_western() {
        assert_eq!(tile_topic(0, -33.9, -70.6), "pp/ip/L0S3500W07500/dict");
        assert_eq!(tile_topic(2, -0.5, -0.5), "pp/ip/L2S0125W00125/dict");
    }
}
