//! Newline-delimited JSON fixes, as read by `waypost run`.
use courier::clock::Clock;
use courier::types::{Coordinate, Fix, Provenance, Timestamp};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct FixLine {
    pub latitude: f64,
    pub longitude: f64,
    /// Defaults to the time the line was read.
    pub timestamp_ms: Option<i64>,
    pub horizontal_accuracy: Option<f64>,
    #[serde(default = "default_provenance")]
    pub provenance: Provenance,
}

fn default_provenance() -> Provenance {
    Provenance::Passive
}

impl FixLine {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn into_fix(self, clock: &dyn Clock) -> (Fix, Provenance) {
        let timestamp = self
            .timestamp_ms
            .map(Timestamp::from_millis)
            .unwrap_or_else(|| clock.now());
        let fix = Fix {
            coordinate: Coordinate::new(self.latitude, self.longitude),
            timestamp,
            horizontal_accuracy: self.horizontal_accuracy,
        };
        (fix, self.provenance)
    }
}
