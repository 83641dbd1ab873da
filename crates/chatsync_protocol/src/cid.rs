//! Channel identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A channel identifier of the form `type:id`.
///
/// The wire form is the joined string; both halves must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    channel_type: String,
    channel_id: String,
}

impl Cid {
    /// Creates a cid from its two halves.
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Parses `type:id`.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        match raw.split_once(':') {
            Some((channel_type, channel_id)) if !channel_type.is_empty() && !channel_id.is_empty() => {
                Ok(Self::new(channel_type, channel_id))
            }
            _ => Err(ProtocolError::InvalidCid(raw.to_string())),
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Returns the channel id.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

impl FromStr for Cid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let cid = Cid::parse("messaging:general").unwrap();
        assert_eq!(cid.channel_type(), "messaging");
        assert_eq!(cid.channel_id(), "general");
        assert_eq!(cid.to_string(), "messaging:general");
    }

    #[test]
    fn id_may_contain_colons() {
        let cid = Cid::parse("livestream:a:b").unwrap();
        assert_eq!(cid.channel_type(), "livestream");
        assert_eq!(cid.channel_id(), "a:b");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Cid::parse("general").is_err());
        assert!(Cid::parse(":general").is_err());
        assert!(Cid::parse("messaging:").is_err());
    }

    #[test]
    fn serde_uses_wire_string() {
        let cid = Cid::new("team", "dev");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, "\"team:dev\"");
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
        assert!(serde_json::from_str::<Cid>("\"nocolon\"").is_err());
    }
}
