//! Awareness: ephemeral per-participant presence (cursor, name, color).
//!
//! Every participant owns one entry, keyed by [`ClientId`], holding an opaque
//! JSON state and a logical clock. Deltas name a set of entries; an entry
//! replaces the known one only if its clock is newer (or equal, when it
//! removes a live state). A delta is decoded completely before anything is
//! applied, so it is never partially merged.
//!
//! `Awareness` is a cheap cloneable handle: the editor and the provider hold
//! clones of the same table. Every accepted change is published to
//! subscribers together with its [`Origin`].

use crate::{ClientId, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("Malformed awareness delta: {0}")]
    Decode(#[from] bincode::Error),
    #[error("Invalid state JSON for client {client}: {source}")]
    StateJson {
        client: ClientId,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, AwarenessError>;

/// Who caused an awareness change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// The local user
    Local,
    /// A delta received from this peer
    Remote(PeerId),
    /// Stale remote entries expired
    Timeout,
}

/// Client IDs touched by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every ID named by the change.
    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub change: AwarenessChange,
    pub origin: Origin,
}

/// One entry on the wire. The state travels as JSON text so the outer
/// encoding stays self-describing-free (bincode).
#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    client: u64,
    clock: u32,
    state: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u32,
    last_updated: Instant,
}

#[derive(Default)]
struct Table {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, Meta>,
}

struct Inner {
    client_id: ClientId,
    table: Mutex<Table>,
    observers: Mutex<Vec<mpsc::UnboundedSender<AwarenessUpdate>>>,
}

/// Shared awareness table.
#[derive(Clone)]
pub struct Awareness {
    inner: Arc<Inner>,
}

impl Awareness {
    /// Create a table whose local participant starts with an empty object state.
    pub fn new(client_id: ClientId) -> Self {
        let mut table = Table::default();
        table.states.insert(client_id, Value::Object(Default::default()));
        table.meta.insert(
            client_id,
            Meta {
                clock: 0,
                last_updated: Instant::now(),
            },
        );
        Self {
            inner: Arc::new(Inner {
                client_id,
                table: Mutex::new(table),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    /// Receive every accepted change from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn local_state(&self) -> Option<Value> {
        self.table().states.get(&self.inner.client_id).cloned()
    }

    /// Snapshot of every known state.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.table().states.clone()
    }

    /// IDs of every participant with a live state.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.table().states.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Replace the local state. `None` announces that we left.
    pub fn set_local_state(&self, state: Option<Value>) {
        let change = {
            let mut table = self.table();
            set_local(&mut table, self.inner.client_id, state)
        };
        self.emit(change, Origin::Local);
    }

    /// Set one field of the local state object, creating the object if needed.
    pub fn set_local_field(&self, key: &str, value: Value) {
        let change = {
            let mut table = self.table();
            let mut state = match table.states.get(&self.inner.client_id) {
                Some(Value::Object(map)) => map.clone(),
                _ => Default::default(),
            };
            state.insert(key.to_string(), value);
            set_local(&mut table, self.inner.client_id, Some(Value::Object(state)))
        };
        self.emit(change, Origin::Local);
    }

    /// Encode the entries for `ids`. Unknown IDs are skipped; known IDs
    /// without a state are encoded as removals.
    pub fn encode(&self, ids: &[ClientId]) -> Vec<u8> {
        let table = self.table();
        let entries: Vec<WireEntry> = ids
            .iter()
            .filter_map(|id| {
                let meta = table.meta.get(id)?;
                Some(WireEntry {
                    client: id.as_u64(),
                    clock: meta.clock,
                    state: table.states.get(id).map(|s| s.to_string()),
                })
            })
            .collect();
        bincode::serialize(&entries).expect("awareness entries always serialize")
    }

    /// Encode every live state.
    pub fn encode_all(&self) -> Vec<u8> {
        self.encode(&self.client_ids())
    }

    /// Merge a delta received from `origin`.
    ///
    /// Our own entry is never overwritten by a remote delta. If a remote
    /// claims our live state was removed, we bump our clock instead so the
    /// next broadcast re-asserts it.
    pub fn apply(&self, delta: &[u8], origin: Origin) -> Result<AwarenessChange> {
        let wire: Vec<WireEntry> = bincode::deserialize(delta)?;
        let mut entries = Vec::with_capacity(wire.len());
        for entry in wire {
            let client = ClientId::from(entry.client);
            let state = match entry.state {
                Some(json) => Some(
                    serde_json::from_str::<Value>(&json)
                        .map_err(|source| AwarenessError::StateJson { client, source })?,
                ),
                None => None,
            };
            entries.push((client, entry.clock, state));
        }

        let change = {
            let mut table = self.table();
            let now = Instant::now();
            let mut change = AwarenessChange::default();

            for (client, clock, state) in entries {
                let prev_meta = table.meta.get(&client).copied();
                let current_clock = prev_meta.map(|m| m.clock).unwrap_or(0);
                let has_state = table.states.contains_key(&client);

                if client == self.inner.client_id {
                    if state.is_none() && has_state && clock >= current_clock {
                        table.meta.insert(
                            client,
                            Meta {
                                clock: clock.saturating_add(1),
                                last_updated: now,
                            },
                        );
                        change.updated.push(client);
                    }
                    continue;
                }

                let newer = prev_meta.is_none() || current_clock < clock;
                let removes_live = current_clock == clock && state.is_none() && has_state;
                if !(newer || removes_live) {
                    continue;
                }

                let removed = state.is_none();
                match state {
                    Some(state) => {
                        table.states.insert(client, state);
                    }
                    None => {
                        table.states.remove(&client);
                    }
                }
                table.meta.insert(
                    client,
                    Meta {
                        clock,
                        last_updated: now,
                    },
                );

                if removed {
                    if has_state {
                        change.removed.push(client);
                    }
                } else if has_state {
                    change.updated.push(client);
                } else {
                    change.added.push(client);
                }
            }
            change
        };

        self.emit(change.clone(), origin);
        Ok(change)
    }

    /// Drop the states of `ids`. Removing our own ID bumps our clock so the
    /// removal wins on other replicas.
    pub fn remove_states(&self, ids: &[ClientId], origin: Origin) -> AwarenessChange {
        let change = {
            let mut table = self.table();
            let now = Instant::now();
            let mut change = AwarenessChange::default();
            for id in ids {
                if table.states.remove(id).is_none() {
                    continue;
                }
                if let Some(meta) = table.meta.get_mut(id) {
                    if *id == self.inner.client_id {
                        meta.clock = meta.clock.saturating_add(1);
                    }
                    meta.last_updated = now;
                }
                change.removed.push(*id);
            }
            change
        };
        self.emit(change.clone(), origin);
        change
    }

    /// Housekeeping: renew our own entry once half of `timeout` has passed
    /// since it last changed, and drop remote entries not refreshed within
    /// `timeout`. Returns the expired IDs.
    pub fn check_outdated(&self, timeout: Duration) -> Vec<ClientId> {
        let own = self.inner.client_id;
        let (renew, expired) = {
            let table = self.table();
            let renew = table.states.contains_key(&own)
                && table
                    .meta
                    .get(&own)
                    .map(|m| m.last_updated.elapsed() >= timeout / 2)
                    .unwrap_or(false);
            let expired: Vec<ClientId> = table
                .meta
                .iter()
                .filter(|(id, meta)| {
                    **id != own
                        && table.states.contains_key(id)
                        && meta.last_updated.elapsed() >= timeout
                })
                .map(|(id, _)| *id)
                .collect();
            (renew, expired)
        };

        if renew {
            self.set_local_state(self.local_state());
        }
        if !expired.is_empty() {
            self.remove_states(&expired, Origin::Timeout);
        }
        expired
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, change: AwarenessChange, origin: Origin) {
        if change.is_empty() {
            return;
        }
        let update = AwarenessUpdate { change, origin };
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

fn set_local(table: &mut Table, own: ClientId, state: Option<Value>) -> AwarenessChange {
    let clock = table.meta.get(&own).map(|m| m.clock.saturating_add(1)).unwrap_or(0);
    let had_state = table.states.contains_key(&own);
    let has_state = state.is_some();
    match state {
        Some(state) => {
            table.states.insert(own, state);
        }
        None => {
            table.states.remove(&own);
        }
    }
    table.meta.insert(
        own,
        Meta {
            clock,
            last_updated: Instant::now(),
        },
    );

    let mut change = AwarenessChange::default();
    match (had_state, has_state) {
        (false, true) => change.added.push(own),
        (true, false) => change.removed.push(own),
        (true, true) => change.updated.push(own),
        (false, false) => {}
    }
    change
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote() -> Origin {
        Origin::Remote("peer-b".parse().unwrap())
    }

    fn pair() -> (Awareness, Awareness) {
        (
            Awareness::new(ClientId::from(1)),
            Awareness::new(ClientId::from(2)),
        )
    }

    #[test]
    fn test_new_has_empty_local_state() {
        let a = Awareness::new(ClientId::from(1));
        assert_eq!(a.local_state(), Some(json!({})));
        assert_eq!(a.client_ids(), vec![ClientId::from(1)]);
    }

    #[test]
    fn test_apply_adds_then_updates() {
        let (a, b) = pair();
        b.set_local_field("name", json!("bob"));

        let change = a.apply(&b.encode_all(), remote()).unwrap();
        assert_eq!(change.added, vec![ClientId::from(2)]);
        assert_eq!(a.states()[&ClientId::from(2)], json!({"name": "bob"}));

        b.set_local_field("cursor", json!(4));
        let change = a.apply(&b.encode_all(), remote()).unwrap();
        assert_eq!(change.updated, vec![ClientId::from(2)]);
        assert_eq!(
            a.states()[&ClientId::from(2)],
            json!({"name": "bob", "cursor": 4})
        );
    }

    #[test]
    fn test_stale_clock_ignored() {
        let (a, b) = pair();
        let old = b.encode_all();
        b.set_local_field("cursor", json!(9));
        a.apply(&b.encode_all(), remote()).unwrap();

        let change = a.apply(&old, remote()).unwrap();
        assert!(change.is_empty());
        assert_eq!(a.states()[&ClientId::from(2)], json!({"cursor": 9}));
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let (a, b) = pair();
        let delta = b.encode_all();
        assert!(!a.apply(&delta, remote()).unwrap().is_empty());
        assert!(a.apply(&delta, remote()).unwrap().is_empty());
    }

    #[test]
    fn test_remote_removal() {
        let (a, b) = pair();
        a.apply(&b.encode_all(), remote()).unwrap();

        b.set_local_state(None);
        let change = a.apply(&b.encode(&[ClientId::from(2)]), remote()).unwrap();
        assert_eq!(change.removed, vec![ClientId::from(2)]);
        assert!(!a.states().contains_key(&ClientId::from(2)));
    }

    #[test]
    fn test_own_entry_never_merged_from_remote() {
        let (a, b) = pair();
        a.set_local_field("name", json!("alice"));
        b.apply(&a.encode_all(), remote()).unwrap();

        // b echoes a's entry back with a forged newer state
        let forged = bincode::serialize(&vec![WireEntry {
            client: 1,
            clock: 99,
            state: Some(r#"{"name":"mallory"}"#.into()),
        }])
        .unwrap();
        let change = a.apply(&forged, remote()).unwrap();
        assert!(change.is_empty());
        assert_eq!(a.local_state(), Some(json!({"name": "alice"})));

        // An echo of our own delta is a no-op too
        assert!(a.apply(&a.encode_all(), remote()).unwrap().is_empty());
    }

    #[test]
    fn test_remote_removal_of_self_reasserts() {
        let a = Awareness::new(ClientId::from(1));
        let forged = bincode::serialize(&vec![WireEntry {
            client: 1,
            clock: 5,
            state: None,
        }])
        .unwrap();
        let change = a.apply(&forged, remote()).unwrap();
        assert_eq!(change.updated, vec![ClientId::from(1)]);
        assert_eq!(a.local_state(), Some(json!({})));

        let b = Awareness::new(ClientId::from(2));
        b.apply(&a.encode_all(), remote()).unwrap();
        assert!(b.states().contains_key(&ClientId::from(1)));
    }

    #[test]
    fn test_remote_removal_at_max_clock_saturates() {
        let a = Awareness::new(ClientId::from(1));
        let forged = bincode::serialize(&vec![WireEntry {
            client: 1,
            clock: u32::MAX,
            state: None,
        }])
        .unwrap();
        let change = a.apply(&forged, remote()).unwrap();
        assert_eq!(change.updated, vec![ClientId::from(1)]);
        assert_eq!(a.local_state(), Some(json!({})));

        a.set_local_field("name", json!("A"));
        a.remove_states(&[ClientId::from(1)], Origin::Local);
        let wire: Vec<WireEntry> = bincode::deserialize(&a.encode(&[ClientId::from(1)])).unwrap();
        assert_eq!(wire[0].clock, u32::MAX);
        assert!(wire[0].state.is_none());
    }

    #[test]
    fn test_invalid_delta_applies_nothing() {
        let a = Awareness::new(ClientId::from(1));
        let bad = bincode::serialize(&vec![
            WireEntry {
                client: 7,
                clock: 1,
                state: Some("{}".into()),
            },
            WireEntry {
                client: 8,
                clock: 1,
                state: Some("{not json".into()),
            },
        ])
        .unwrap();
        assert!(matches!(
            a.apply(&bad, remote()),
            Err(AwarenessError::StateJson { .. })
        ));
        assert!(!a.states().contains_key(&ClientId::from(7)));
        assert!(a.apply(&[0xff, 0xff], remote()).is_err());
    }

    #[test]
    fn test_encode_skips_unknown_ids() {
        let a = Awareness::new(ClientId::from(1));
        let b = Awareness::new(ClientId::from(2));
        let delta = a.encode(&[ClientId::from(1), ClientId::from(42)]);
        let change = b.apply(&delta, remote()).unwrap();
        assert_eq!(change.added, vec![ClientId::from(1)]);
        assert_eq!(b.client_ids().len(), 2);
    }

    #[test]
    fn test_subscribers_see_origin() {
        let (a, b) = pair();
        let mut rx = a.subscribe();

        a.set_local_field("x", json!(1));
        let update = rx.try_recv().unwrap();
        assert_eq!(update.origin, Origin::Local);
        assert_eq!(update.change.updated, vec![ClientId::from(1)]);

        a.apply(&b.encode_all(), remote()).unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.origin, remote());
        assert_eq!(update.change.added, vec![ClientId::from(2)]);

        // No-op changes are not published
        a.apply(&b.encode_all(), remote()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_own_state_bumps_clock() {
        let (a, b) = pair();
        b.apply(&a.encode_all(), remote()).unwrap();

        let change = a.remove_states(&[ClientId::from(1)], Origin::Local);
        assert_eq!(change.removed, vec![ClientId::from(1)]);
        assert_eq!(a.local_state(), None);

        b.apply(&a.encode(&[ClientId::from(1)]), remote()).unwrap();
        assert!(!b.states().contains_key(&ClientId::from(1)));
    }

    #[test]
    fn test_check_outdated_expires_remote_and_renews_local() {
        let (a, b) = pair();
        a.apply(&b.encode_all(), remote()).unwrap();
        let mut rx = a.subscribe();

        let expired = a.check_outdated(Duration::ZERO);
        assert_eq!(expired, vec![ClientId::from(2)]);
        assert!(!a.states().contains_key(&ClientId::from(2)));
        assert_eq!(a.local_state(), Some(json!({})));

        let renewal = rx.try_recv().unwrap();
        assert_eq!(renewal.origin, Origin::Local);
        let expiry = rx.try_recv().unwrap();
        assert_eq!(expiry.origin, Origin::Timeout);
    }

    #[test]
    fn test_check_outdated_keeps_fresh_entries() {
        let (a, b) = pair();
        a.apply(&b.encode_all(), remote()).unwrap();
        assert!(a.check_outdated(Duration::from_secs(30)).is_empty());
        assert_eq!(a.client_ids().len(), 2);
    }
}
