//! NMEA sentence extraction from a raw receiver byte stream.
//!
//! The receiver interleaves NMEA with binary UBX, RTCM and SPARTN traffic, so
//! the parser only accepts bytes that can appear in an NMEA sentence and drops
//! anything else. Only sentences with a valid `*hh` checksum are emitted.

/// Longest sentence accepted, without the line terminator. NMEA 0183 allows
/// 80 characters; u-blox high precision GGA runs a little longer.
pub const MAX_SENTENCE_LENGTH: usize = 120;

/// Incremental NMEA parser.
///
/// State is kept across calls to [`NmeaParser::push`], so a sentence may be
/// split over any number of reads.
#[derive(Debug, Default)]
pub struct NmeaParser {
    buffer: Option<Vec<u8>>,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete, checksum-valid sentence.
    ///
    /// Returned sentences start with `$` and carry no line terminator.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut sentences = Vec::new();

        for &byte in data {
            if byte == b'$' {
                self.buffer = Some(vec![byte]);
                continue;
            }
            let Some(buffer) = self.buffer.as_mut() else {
                continue;
            };
            match byte {
                b'A'..=b'Z' | b'0'..=b'9' | b',' | b'.' | b'-' | b'*' => {
                    if buffer.len() < MAX_SENTENCE_LENGTH {
                        buffer.push(byte);
                    } else {
                        self.buffer = None;
                    }
                }
                b'\r' => {
                    if let Some(buffer) = self.buffer.take() {
                        if let Some(sentence) = verify(buffer) {
                            sentences.push(sentence);
                        }
                    }
                }
                _ => self.buffer = None,
            }
        }

        sentences
    }
}

/// Check the trailing `*hh` checksum of a buffered sentence.
fn verify(buffer: Vec<u8>) -> Option<String> {
    let len = buffer.len();
    if len <= 3 || buffer[len - 3] != b'*' {
        return None;
    }

    let received = std::str::from_utf8(&buffer[len - 2..])
        .ok()
        .and_then(|hex| u8::from_str_radix(hex, 16).ok());
    let computed = buffer[1..len - 3].iter().fold(0u8, |acc, b| acc ^ b);

    match received {
        Some(received) if received == computed => String::from_utf8(buffer).ok(),
        Some(received) => {
            log::warn!("chksum error: {:02x} != {:02x}", received, computed);
            None
        }
        None => {
            log::warn!("chksum error: ?? != {:02x}", computed);
            None
        }
    }
}

/// True for GGA sentences from any talker (`$GPGGA`, `$GNGGA`, ...).
pub fn is_gga(sentence: &str) -> bool {
    let bytes = sentence.as_bytes();
    bytes.len() >= 7
        && bytes[0] == b'$'
        && bytes[1] == b'G'
        && bytes[2].is_ascii_uppercase()
        && &bytes[3..7] == b"GGA,"
}

/// Position fix decoded from a GGA sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gga {
    /// Fix quality indicator (0 = no fix, 4 = RTK fixed, 6 = estimated, ...)
    pub quality: u8,
    /// Latitude in decimal degrees, negative south
    pub lat: f64,
    /// Longitude in decimal degrees, negative west
    pub lon: f64,
}

impl Gga {
    /// Decode a checksum-verified GGA sentence. Empty fields read as zero.
    pub fn parse(sentence: &str) -> Option<Self> {
        let fields: Vec<&str> = sentence.split(',').collect();
        if fields.len() < 7 {
            return None;
        }

        let quality = parse_or_zero::<u8>(fields[6])?;
        let mut lat = degrees(parse_or_zero::<f64>(fields[2])?);
        if fields[3] == "S" {
            lat = -lat;
        }
        let mut lon = degrees(parse_or_zero::<f64>(fields[4])?);
        if fields[5] == "W" {
            lon = -lon;
        }

        Some(Self { quality, lat, lon })
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(field: &str) -> Option<T> {
    if field.is_empty() {
        Some(T::default())
    } else {
        field.parse().ok()
    }
}

/// Convert NMEA `dddmm.mmmm` to decimal degrees.
fn degrees(value: f64) -> f64 {
    (value / 100.0).trunc() + (value % 100.0) / 60.0
}
