use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// RFC3339 with a mandatory offset (`Z` or `±hh:mm`), up to microseconds.
static RFC3339_WITH_TZ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,6})?(?:Z|[+-]\d{2}:\d{2})$")
        .expect("timestamp pattern is valid")
});

/// RFC3339 shape without any offset; used to distinguish "naive timestamp"
/// from "not a timestamp at all" in error reporting.
static RFC3339_NAIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?$")
        .expect("naive timestamp pattern is valid")
});

/// A string that has been trimmed and verified non-empty at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Trim and wrap `value`, rejecting whitespace-only input.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let trimmed = value.into().trim().to_owned();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed))
        }
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for NonEmptyString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).ok_or_else(|| de::Error::custom("non_empty_required: empty string"))
    }
}

/// Why a timestamp string was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    /// Shaped like a timestamp but carries no UTC offset.
    MissingOffset,
    /// Not an RFC3339 timestamp at all.
    NotRfc3339,
}

/// An RFC3339 timestamp that carried an explicit UTC offset on the wire.
///
/// The original string is retained so that re-serializing an envelope
/// reproduces exactly what was received. Equality compares the instant, so
/// `2026-02-18T10:00:00Z` and `2026-02-18T11:00:00+01:00` are equal.
#[derive(Debug, Clone)]
pub struct Timestamp {
    raw: String,
    instant: DateTime<FixedOffset>,
}

impl Timestamp {
    /// Parse an RFC3339 string, requiring an explicit offset.
    pub fn parse(value: &str) -> Result<Self, TimestampError> {
        let trimmed = value.trim();
        if !RFC3339_WITH_TZ.is_match(trimmed) {
            return Err(if RFC3339_NAIVE.is_match(trimmed) {
                TimestampError::MissingOffset
            } else {
                TimestampError::NotRfc3339
            });
        }
        let instant = DateTime::parse_from_rfc3339(trimmed)
            .map_err(|_| TimestampError::NotRfc3339)?;
        Ok(Self {
            raw: trimmed.to_owned(),
            instant,
        })
    }

    /// The parsed instant.
    #[must_use]
    pub fn instant(&self) -> DateTime<FixedOffset> {
        self.instant
    }

    /// The original wire string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Build a timestamp from a `chrono` datetime (for envelopes produced
    /// locally rather than parsed off the wire).
    ///
    /// Truncates to microseconds so the value is identical after a trip
    /// through the wire format.
    #[must_use]
    pub fn from_datetime(value: DateTime<FixedOffset>) -> Self {
        use chrono::Timelike;
        let truncated = value
            .with_nanosecond(value.nanosecond() / 1_000 * 1_000)
            .unwrap_or(value);
        Self {
            raw: truncated.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            instant: truncated,
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
    }
}

impl Eq for Timestamp {}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an RFC3339 timestamp string with a UTC offset")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Timestamp, E> {
                Timestamp::parse(value).map_err(|e| match e {
                    TimestampError::MissingOffset => {
                        E::custom("timezone_required: timestamp lacks a UTC offset")
                    }
                    TimestampError::NotRfc3339 => {
                        E::custom("rfc3339_string_required: not an RFC3339 timestamp")
                    }
                })
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Timestamp, E> {
                Err(E::custom("rfc3339_string_required: integer epoch not accepted"))
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Timestamp, E> {
                Err(E::custom("rfc3339_string_required: integer epoch not accepted"))
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Timestamp, E> {
                Err(E::custom("rfc3339_string_required: float epoch not accepted"))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

/// A request identifier constrained to UUID version 7.
///
/// UUIDv7 carries a millisecond timestamp prefix, which keeps request ids
/// sortable in index order across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Wrap a UUID, rejecting anything that is not version 7.
    pub fn new(id: Uuid) -> Option<Self> {
        (id.get_version_num() == 7).then_some(Self(id))
    }

    /// Generate a fresh v7 request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// The inner UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = Uuid::deserialize(deserializer)
            .map_err(|_| de::Error::custom("uuid7_required: not a valid UUID"))?;
        Self::new(id).ok_or_else(|| de::Error::custom("uuid7_required: UUID is not version 7"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_trims_and_rejects_blank() {
        assert_eq!(NonEmptyString::new("  hi  ").unwrap().as_str(), "hi");
        assert!(NonEmptyString::new("   ").is_none());
        assert!(NonEmptyString::new("").is_none());
    }

    #[test]
    fn timestamp_requires_offset() {
        assert!(Timestamp::parse("2026-02-18T10:00:00Z").is_ok());
        assert!(Timestamp::parse("2026-02-18T10:00:00+05:30").is_ok());
        assert!(Timestamp::parse("2026-02-18T10:00:00.123456-08:00").is_ok());
        // Naive timestamp: distinguishable from garbage.
        assert_eq!(
            Timestamp::parse("2026-02-18T10:00:00"),
            Err(TimestampError::MissingOffset)
        );
        assert_eq!(
            Timestamp::parse("not a time"),
            Err(TimestampError::NotRfc3339)
        );
        assert_eq!(
            Timestamp::parse("1708250400"),
            Err(TimestampError::NotRfc3339)
        );
    }

    #[test]
    fn timestamp_equality_is_instant_based() {
        let utc = Timestamp::parse("2026-02-18T10:00:00Z").unwrap();
        let offset = Timestamp::parse("2026-02-18T11:00:00+01:00").unwrap();
        assert_eq!(utc, offset);
        assert_ne!(utc.as_str(), offset.as_str());
    }

    #[test]
    fn timestamp_roundtrips_raw_string() {
        let ts: Timestamp = serde_json::from_str("\"2026-02-18T10:00:00.500000+02:00\"").unwrap();
        assert_eq!(
            serde_json::to_string(&ts).unwrap(),
            "\"2026-02-18T10:00:00.500000+02:00\""
        );
    }

    #[test]
    fn locally_built_timestamps_survive_the_wire_format() {
        let now = chrono::Utc::now().fixed_offset();
        let ts = Timestamp::from_datetime(now);
        let reparsed = Timestamp::parse(ts.as_str()).unwrap();
        assert_eq!(ts, reparsed);
    }

    #[test]
    fn timestamp_rejects_integer_epoch() {
        let err = serde_json::from_str::<Timestamp>("1708250400").unwrap_err();
        assert!(err.to_string().contains("rfc3339_string_required"));
    }

    #[test]
    fn request_id_requires_v7() {
        assert!(RequestId::new(Uuid::new_v4()).is_none());
        assert!(RequestId::new(Uuid::now_v7()).is_some());
        let err = serde_json::from_str::<RequestId>(
            "\"550e8400-e29b-41d4-a716-446655440000\"",
        )
        .unwrap_err();
        assert!(err.to_string().contains("uuid7_required"));
    }
}
