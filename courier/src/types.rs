use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Milliseconds since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Floor value for endpoints that never acknowledged anything.
    /// 0001-01-01 00:00:00 UTC, earlier than any real fix.
    pub const DISTANT_PAST: Timestamp = Timestamp(-62_135_596_800_000);

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp(i64::try_from(since.as_millis()).unwrap_or(i64::MAX)),
            Err(before) => {
                Timestamp(-i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX))
            }
        }
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(millis))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }

    /// Time elapsed from `earlier` to `self`. Zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(delta).unwrap_or(0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Timestamp::DISTANT_PAST {
            write!(f, "distant-past")
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinate {
            latitude,
            longitude,
        }
    }
}

/// Where a fix came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Result of an explicit fetch.
    Active,
    /// Ambient update delivered by the platform.
    Passive,
}

impl Provenance {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Provenance::Active => "active",
            Provenance::Passive => "passive",
        }
    }
}

/// A single point-in-time location reading, as delivered by a location source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub coordinate: Coordinate,
    pub timestamp: Timestamp,
    pub horizontal_accuracy: Option<f64>,
}

impl Fix {
    pub fn new(coordinate: Coordinate, timestamp: Timestamp) -> Self {
        Fix {
            coordinate,
            timestamp,
            horizontal_accuracy: None,
        }
    }
}

/// A queued location. Never mutated after creation; removed only by pruning.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationRecord {
    pub created_at: Timestamp,
    pub coordinate: Coordinate,
    pub provenance: Provenance,
    /// Enrichment fields, sent as-is to every endpoint.
    pub payload: serde_json::Value,
}

impl LocationRecord {
    pub fn new(
        created_at: Timestamp,
        coordinate: Coordinate,
        provenance: Provenance,
        payload: serde_json::Value,
    ) -> Self {
        LocationRecord {
            created_at,
            coordinate,
            provenance,
            payload,
        }
    }
}

/// Normalized endpoint identity: the lower-cased destination address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(address: &str) -> Self {
        EndpointId(address.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Url> for EndpointId {
    fn from(url: &Url) -> Self {
        EndpointId::new(url.as_str())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A collection endpoint. Fixed for the lifetime of a tracking session.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EndpointTarget {
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EndpointTarget {
    pub fn new(url: Url) -> Self {
        EndpointTarget {
            url,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> EndpointId {
        EndpointId::from(&self.url)
    }
}
