use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `major.minor` schema version as declared by the envelope and by the
/// conversation document. Ordering is lexicographic over (major, minor),
/// which is what version comparisons like "1.1 or later" want.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const V1_0: SchemaVersion = SchemaVersion { major: 1, minor: 0 };
    pub const V1_1: SchemaVersion = SchemaVersion { major: 1, minor: 1 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed schema version {0:?}, expected <major>.<minor>")]
pub struct ParseVersionError(pub String);

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| ParseVersionError(s.to_string()))?;

        let parse = |part: &str| -> Result<u32, ParseVersionError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseVersionError(s.to_string()));
            }
            part.parse().map_err(|_| ParseVersionError(s.to_string()))
        };
        Ok(SchemaVersion {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_round_trip_and_ordering() {
        let v: SchemaVersion = "1.1".parse().unwrap();
        assert_eq!(v, SchemaVersion::V1_1);
        assert!(SchemaVersion::V1_0 < SchemaVersion::V1_1);
        assert!(SchemaVersion::new(2, 0) > SchemaVersion::V1_1);
        assert_eq!(v.to_string(), "1.1");
    }

    #[test]
    fn version_rejects_malformed() {
        for bad in ["1", "1.", ".1", "1.x", "v1.0", "1.0.0", "-1.0", " 1.0"] {
            assert!(bad.parse::<SchemaVersion>().is_err(), "{bad}");
        }
    }

    #[test]
    fn version_serde_uses_string_form() {
        let v: SchemaVersion = serde_json::from_str(r#""1.0""#).unwrap();
        assert_eq!(v, SchemaVersion::V1_0);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#""1.0""#);
    }
}
