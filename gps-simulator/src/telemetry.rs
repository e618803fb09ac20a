use crate::errors::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Area the simulated device moves in (New York City).
pub struct BoundingBox;

impl BoundingBox {
    pub const LAT_MIN: f64 = 40.4774;
    pub const LAT_MAX: f64 = 40.9176;
    pub const LON_MIN: f64 = -74.2591;
    pub const LON_MAX: f64 = -73.7002;

    pub fn contains(latitude: f64, longitude: f64) -> bool {
        (Self::LAT_MIN..=Self::LAT_MAX).contains(&latitude)
            && (Self::LON_MIN..=Self::LON_MAX).contains(&longitude)
    }
}

/// One GPS position sample as published to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl Telemetry {
    /// Draws a position uniformly from the bounding box.
    pub fn generate(rng: &mut impl Rng, device_id: String, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            latitude: rng.gen_range(BoundingBox::LAT_MIN..=BoundingBox::LAT_MAX),
            longitude: rng.gen_range(BoundingBox::LON_MIN..=BoundingBox::LON_MAX),
            timestamp: now,
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Timestamps travel as fractional seconds since the Unix epoch.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = value.timestamp() as f64 + f64::from(value.timestamp_subsec_nanos()) / 1e9;
        serializer.serialize_f64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(de::Error::custom("timestamp must be a finite number"));
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
            .ok_or_else(|| de::Error::custom(format!("timestamp {} out of range", secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_samples_stay_inside_bounding_box() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let t = Telemetry::generate(&mut rng, "dev-1".to_string(), Utc::now());
            assert!(
                BoundingBox::contains(t.latitude, t.longitude),
                "({}, {}) outside bounding box",
                t.latitude,
                t.longitude
            );
        }
    }

    #[test]
    fn test_same_seed_same_positions() {
        let now = Utc::now();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);

        for _ in 0..5 {
            let ta = Telemetry::generate(&mut a, "dev-1".to_string(), now);
            let tb = Telemetry::generate(&mut b, "dev-1".to_string(), now);
            assert_eq!(ta, tb);
        }
    }

    #[test]
    fn test_payload_has_exactly_four_fields() {
        let mut rng = StdRng::seed_from_u64(1);
        let t = Telemetry::generate(&mut rng, "dev-1".to_string(), Utc::now());
        let payload = t.to_payload().unwrap();

        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["device_id", "latitude", "longitude", "timestamp"]);
        assert_eq!(object["device_id"], "dev-1");
        assert!(object["timestamp"].is_f64());
    }

    #[test]
    fn test_payload_parses_back() {
        let now = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let t = Telemetry::generate(&mut rng, "dev-1".to_string(), now);

        let parsed = Telemetry::from_payload(t.to_payload().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.device_id, "dev-1");
        assert_eq!(parsed.latitude, t.latitude);
        assert_eq!(parsed.longitude, t.longitude);
        assert_eq!(parsed.timestamp, now);
    }

    #[test]
    fn test_timestamp_is_fractional_seconds() {
        let now = DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap();
        let t = Telemetry {
            device_id: "dev-1".to_string(),
            latitude: 40.7,
            longitude: -74.0,
            timestamp: now,
        };

        let value: serde_json::Value = serde_json::from_str(&t.to_payload().unwrap()).unwrap();
        assert_eq!(value["timestamp"].as_f64(), Some(1_700_000_000.5));
    }

    #[test]
    fn test_extra_field_rejected() {
        let payload = br#"{"device_id":"dev-1","latitude":40.7,"longitude":-74.0,"timestamp":1.0,"speed":3}"#;
        assert!(Telemetry::from_payload(payload).is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let payload = br#"{"device_id":"dev-1","latitude":40.7,"timestamp":1.0}"#;
        assert!(Telemetry::from_payload(payload).is_err());
    }
}
