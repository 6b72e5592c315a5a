//! Device addressing.
//!
//! Every envelope fans out to *devices*, not users: the `wrappedKeys` map is
//! keyed by the `"userId:deviceId"` string the browser client uses. The
//! address type serialises to exactly that form so `BTreeMap<DeviceAddress, _>`
//! produces the wire map unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtoError;

/// One device of one user. Orderable so envelope maps serialise in a stable
/// order regardless of insertion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Validate the component ids: non-empty, no separator collisions.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.user_id.is_empty() || self.device_id.is_empty() {
            return Err(ProtoError::InvalidAddress("empty user or device id".into()));
        }
        if self.user_id.contains(':') || self.device_id.contains(':') {
            return Err(ProtoError::InvalidAddress(format!(
                "ids must not contain ':': {}:{}",
                self.user_id, self.device_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.device_id)
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) = s
            .split_once(':')
            .ok_or_else(|| ProtoError::InvalidAddress(format!("expected user:device, got {s:?}")))?;
        let addr = Self::new(user, device);
        addr.validate()?;
        Ok(addr)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn roundtrip_display_parse() {
        let addr = DeviceAddress::new("alice", "web-1");
        assert_eq!(addr.to_string(), "alice:web-1");
        assert_eq!("alice:web-1".parse::<DeviceAddress>().unwrap(), addr);
    }

    #[test]
    fn rejects_malformed() {
        assert!("no-separator".parse::<DeviceAddress>().is_err());
        assert!(":dev".parse::<DeviceAddress>().is_err());
        assert!("user:".parse::<DeviceAddress>().is_err());
        assert!(DeviceAddress::new("a:b", "dev").validate().is_err());
    }

    #[test]
    fn map_key_form_matches_wire() {
        let mut map = BTreeMap::new();
        map.insert(DeviceAddress::new("bob", "phone"), 1u8);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"bob:phone":1}"#);

        let back: BTreeMap<DeviceAddress, u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
    }
}
