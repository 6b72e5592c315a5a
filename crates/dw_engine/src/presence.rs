//! Who is reachable right now, as reported by the transport.
//!
//! Presence gates two decisions: a decrypt failure only becomes a recovery
//! request when the author is online to answer it, and sends parked for a
//! user with no known devices are released when one shows up.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use dw_proto::address::DeviceAddress;

#[derive(Default)]
pub struct PresenceMap {
    /// user id → online device id → when we last heard it was online.
    online: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

impl PresenceMap {
    pub fn note(&mut self, address: &DeviceAddress, is_online: bool) {
        if is_online {
            self.online
                .entry(address.user_id.clone())
                .or_default()
                .insert(address.device_id.clone(), Utc::now());
        } else if let Some(devices) = self.online.get_mut(&address.user_id) {
            devices.remove(&address.device_id);
            if devices.is_empty() {
                self.online.remove(&address.user_id);
            }
        }
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.online.get(user_id).is_some_and(|d| !d.is_empty())
    }

    pub fn is_device_online(&self, address: &DeviceAddress) -> bool {
        self.online
            .get(&address.user_id)
            .is_some_and(|d| d.contains_key(&address.device_id))
    }

    /// Online devices for a user, device-id order for determinism.
    pub fn online_devices(&self, user_id: &str) -> Vec<DeviceAddress> {
        let mut devices: Vec<DeviceAddress> = self
            .online
            .get(user_id)
            .map(|d| {
                d.keys()
                    .map(|device_id| DeviceAddress::new(user_id, device_id))
                    .collect()
            })
            .unwrap_or_default();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_per_device_and_per_user() {
        let mut presence = PresenceMap::default();
        let phone = DeviceAddress::new("bob", "phone");
        let web = DeviceAddress::new("bob", "web");

        presence.note(&phone, true);
        presence.note(&web, true);
        assert!(presence.is_user_online("bob"));
        assert_eq!(presence.online_devices("bob").len(), 2);

        presence.note(&phone, false);
        assert!(presence.is_user_online("bob"), "one device left");
        assert!(!presence.is_device_online(&phone));

        presence.note(&web, false);
        assert!(!presence.is_user_online("bob"));
        assert!(presence.online_devices("bob").is_empty());
    }
}
