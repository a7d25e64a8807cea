//! Live endpoint and room membership state
//!
//! One `Registry` instance is created at service start and injected into the
//! relay; nothing else may mutate endpoint or room state. Mutations return
//! fully-resolved notifications (`Vec<Outbound>`) instead of invoking
//! callbacks, so a separate dispatch step can deliver them. All operations
//! are idempotent against already-absent ids: duplicate disconnect events
//! are a no-op, not an error.

use crate::protocol::{DeviceInfo, ServerMessage};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Opaque connection id assigned by the relay transport.
pub type EndpointId = String;

/// A notification resolved to a concrete recipient, ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: EndpointId,
    pub message: ServerMessage,
}

struct EndpointEntry {
    name: String,
    since: u64,
}

/// In-memory endpoint and room registry.
#[derive(Default)]
pub struct Registry {
    endpoints: HashMap<EndpointId, EndpointEntry>,
    /// room code -> member id -> cached display name
    rooms: HashMap<String, HashMap<EndpointId, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an endpoint's display name. An empty name gets a generated
    /// `Device-NNNN` placeholder. Triggers a presence broadcast, and a
    /// membership update for every room the endpoint already belongs to
    /// (their cached member name just changed).
    pub fn register(&mut self, id: &str, name: &str) -> Vec<Outbound> {
        let name = if name.is_empty() {
            generated_device_name()
        } else {
            name.to_string()
        };
        let since = self
            .endpoints
            .get(id)
            .map(|e| e.since)
            .unwrap_or_else(now_millis);
        self.endpoints.insert(
            id.to_string(),
            EndpointEntry {
                name: name.clone(),
                since,
            },
        );

        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains_key(id))
            .map(|(code, _)| code.clone())
            .collect();
        for code in &joined {
            if let Some(members) = self.rooms.get_mut(code) {
                members.insert(id.to_string(), name.clone());
            }
        }

        let mut out = self.presence_broadcast();
        for code in &joined {
            out.extend(self.room_count_update(code));
        }
        out
    }

    /// Add an endpoint to a room, creating the room on first join. Existing
    /// members are told about the newcomer; everyone in the room (joiner
    /// included) gets the updated member count.
    pub fn join(&mut self, id: &str, room: &str) -> Vec<Outbound> {
        let cached_name = self
            .endpoints
            .get(id)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        let members = self.rooms.entry(room.to_string()).or_default();
        let rejoin = members.insert(id.to_string(), cached_name).is_some();

        let mut out = Vec::new();
        if !rejoin {
            for other in members.keys().filter(|m| m.as_str() != id) {
                out.push(Outbound {
                    to: other.clone(),
                    message: ServerMessage::PeerJoined {
                        peer: id.to_string(),
                    },
                });
            }
        }
        out.extend(self.room_count_update(room));
        out
    }

    /// Remove an endpoint from every room it belongs to. Rooms that become
    /// empty are deleted; remaining members are told who left and how many
    /// are left. Safe to call for ids that joined nothing.
    pub fn leave(&mut self, id: &str) -> Vec<Outbound> {
        let codes: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains_key(id))
            .map(|(code, _)| code.clone())
            .collect();

        let mut out = Vec::new();
        for code in codes {
            let remaining: Vec<EndpointId> = match self.rooms.get_mut(&code) {
                Some(members) => {
                    members.remove(id);
                    members.keys().cloned().collect()
                }
                None => continue,
            };
            if remaining.is_empty() {
                self.rooms.remove(&code);
                debug!("room {} emptied, removed", code);
                continue;
            }
            for other in &remaining {
                out.push(Outbound {
                    to: other.clone(),
                    message: ServerMessage::PeerLeft {
                        peer: id.to_string(),
                    },
                });
            }
            out.extend(self.room_count_update(&code));
        }
        out
    }

    /// Remove an endpoint entirely. Call after [`leave`](Self::leave) cleanup
    /// on disconnect. A second call for the same id is a no-op.
    pub fn unregister(&mut self, id: &str) -> Vec<Outbound> {
        if self.endpoints.remove(id).is_none() {
            return Vec::new();
        }
        self.presence_broadcast()
    }

    /// Point-in-time "who is online" view. Exposes no room structure.
    pub fn snapshot(&self) -> BTreeMap<EndpointId, DeviceInfo> {
        self.endpoints
            .iter()
            .map(|(id, e)| {
                (
                    id.clone(),
                    DeviceInfo {
                        name: e.name.clone(),
                        since: e.since,
                    },
                )
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }

    /// Current member ids of a room, or empty if the room does not exist.
    pub fn room_members(&self, room: &str) -> Vec<EndpointId> {
        self.rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn presence_broadcast(&self) -> Vec<Outbound> {
        let devices = self.snapshot();
        self.endpoints
            .keys()
            .map(|id| Outbound {
                to: id.clone(),
                message: ServerMessage::Devices {
                    devices: devices.clone(),
                },
            })
            .collect()
    }

    fn room_count_update(&self, room: &str) -> Vec<Outbound> {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        let count = members.len();
        members
            .keys()
            .map(|id| Outbound {
                to: id.clone(),
                message: ServerMessage::RoomMembers {
                    room: room.to_string(),
                    count,
                },
            })
            .collect()
    }
}

fn generated_device_name() -> String {
    format!("Device-{}", rand::thread_rng().gen_range(1000..=9999))
}

/// Draw a 5-digit room code. There is no collision check against existing
/// rooms; a colliding draw merges the two shares into one room.
pub fn generate_room_code() -> String {
    rand::thread_rng().gen_range(10_000..=99_999).to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_sent_to<'a>(out: &'a [Outbound], id: &str) -> Vec<&'a ServerMessage> {
        out.iter().filter(|o| o.to == id).map(|o| &o.message).collect()
    }

    #[test]
    fn test_register_empty_name_generates_device_token() {
        let mut reg = Registry::new();
        reg.register("a", "");
        let snapshot = reg.snapshot();
        let name = &snapshot["a"].name;
        let digits = name.strip_prefix("Device-").expect("generated prefix");
        assert_eq!(digits.len(), 4);
        let n: u32 = digits.parse().expect("numeric suffix");
        assert!((1000..=9999).contains(&n));

        // stable until the next explicit rename
        reg.join("a", "777");
        reg.leave("a");
        assert_eq!(&reg.snapshot()["a"].name, name);

        reg.register("a", "den-pc");
        assert_eq!(&reg.snapshot()["a"].name, "den-pc");
    }

    #[test]
    fn test_register_broadcasts_presence_to_everyone() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        let out = reg.register("b", "B");
        assert_eq!(out.len(), 2);
        for id in ["a", "b"] {
            let msgs = count_sent_to(&out, id);
            assert_eq!(msgs.len(), 1);
            match msgs[0] {
                ServerMessage::Devices { devices } => {
                    assert_eq!(devices.len(), 2);
                    assert_eq!(devices["b"].name, "B");
                }
                other => panic!("expected devices broadcast, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_join_notifies_members_and_counts() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        reg.register("b", "B");
        let out = reg.join("a", "12345");
        // lone joiner: no peer-joined, count goes to the joiner only
        assert_eq!(
            count_sent_to(&out, "a"),
            vec![&ServerMessage::RoomMembers {
                room: "12345".into(),
                count: 1
            }]
        );

        let out = reg.join("b", "12345");
        let to_a = count_sent_to(&out, "a");
        assert!(to_a.contains(&&ServerMessage::PeerJoined { peer: "b".into() }));
        assert!(to_a.contains(&&ServerMessage::RoomMembers {
            room: "12345".into(),
            count: 2
        }));
        let to_b = count_sent_to(&out, "b");
        assert_eq!(
            to_b,
            vec![&ServerMessage::RoomMembers {
                room: "12345".into(),
                count: 2
            }]
        );
    }

    #[test]
    fn test_rejoin_does_not_duplicate_member() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        reg.join("a", "12345");
        let out = reg.join("a", "12345");
        assert_eq!(reg.room_members("12345").len(), 1);
        // no second peer-joined, just a refreshed count
        assert_eq!(
            out,
            vec![Outbound {
                to: "a".into(),
                message: ServerMessage::RoomMembers {
                    room: "12345".into(),
                    count: 1
                }
            }]
        );
    }

    #[test]
    fn test_counts_track_true_set_size_and_empty_rooms_vanish() {
        let mut reg = Registry::new();
        for id in ["a", "b", "c"] {
            reg.register(id, id);
            let out = reg.join(id, "99999");
            let expected = reg.room_members("99999").len();
            for o in out {
                if let ServerMessage::RoomMembers { count, .. } = o.message {
                    assert_eq!(count, expected);
                }
            }
        }
        for id in ["a", "b", "c"] {
            let out = reg.leave(id);
            let expected = reg.room_members("99999").len();
            for o in out {
                if let ServerMessage::RoomMembers { count, .. } = o.message {
                    assert_eq!(count, expected);
                }
            }
        }
        assert!(reg.room_members("99999").is_empty());
        // the room itself is gone, not an empty entry
        assert!(!reg.rooms.contains_key("99999"));
    }

    #[test]
    fn test_leave_notifies_remaining_members() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        reg.register("b", "B");
        reg.join("a", "12345");
        reg.join("b", "12345");
        let out = reg.leave("a");
        let to_b = count_sent_to(&out, "b");
        assert!(to_b.contains(&&ServerMessage::PeerLeft { peer: "a".into() }));
        assert!(to_b.contains(&&ServerMessage::RoomMembers {
            room: "12345".into(),
            count: 1
        }));
        assert!(count_sent_to(&out, "a").is_empty());
    }

    #[test]
    fn test_duplicate_disconnect_is_a_noop() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        reg.join("a", "12345");
        reg.leave("a");
        assert!(reg.room_members("12345").is_empty());
        // second disconnect event for the same connection
        assert!(reg.leave("a").is_empty());
        reg.unregister("a");
        assert!(reg.snapshot().is_empty());
        assert!(reg.unregister("a").is_empty());
        assert!(reg.leave("ghost").is_empty());
        assert!(reg.unregister("ghost").is_empty());
    }

    #[test]
    fn test_rename_refreshes_cached_member_name() {
        let mut reg = Registry::new();
        reg.register("a", "A");
        reg.register("b", "B");
        reg.join("a", "12345");
        reg.join("b", "12345");
        let out = reg.register("a", "A-renamed");
        assert_eq!(reg.rooms["12345"]["a"], "A-renamed");
        // rename re-broadcasts the room count alongside presence
        assert!(out.iter().any(|o| matches!(
            o.message,
            ServerMessage::RoomMembers { count: 2, .. }
        )));
    }

    #[test]
    fn test_generated_room_code_is_five_digits() {
        for _ in 0..32 {
            let code = generate_room_code();
            assert_eq!(code.len(), 5);
            let n: u32 = code.parse().unwrap();
            assert!((10_000..=99_999).contains(&n));
        }
    }
}
