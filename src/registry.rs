//! User authentication table and per-user traffic accounting.
//!
//! Grounded on `internal/app/service/users.go`'s `UserManager`/`TrafficManager`
//! (a pair of `sync.Map`s) and on spec §4.H. `dashmap` replaces `sync.Map`:
//! the auth path is read-heavy from many connection tasks and the traffic
//! path needs an atomic load-or-create on first stream, which a sharded
//! concurrent map gives for free via its `entry` API.

use crate::counter::Counter;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A roster entry as returned by `GET /users`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    #[serde(default)]
    pub speed_limit: Option<u64>,
    #[serde(default)]
    pub device_limit: Option<u32>,
}

/// A single user's traffic counters since the last report.
#[derive(Debug, Default)]
pub struct TrafficItem {
    pub up: Counter,
    pub down: Counter,
    pub count: Counter,
}

impl TrafficItem {
    pub fn new() -> Self {
        TrafficItem {
            up: Counter::new(0),
            down: Counter::new(0),
            count: Counter::new(0),
        }
    }

    /// Resets all three counters. The source's equivalent (`TrafficItem.delete`)
    /// resets `Count` twice and never resets `Down` -- a typo preserved
    /// nowhere here; see DESIGN.md for the decision to fix the obvious bug
    /// while keeping the "streams opened" counting semantics it sits next to.
    fn clear(&self) {
        self.up.reset();
        self.down.reset();
        self.count.reset();
    }
}

/// One reporting-window snapshot for a single user, as POSTed to
/// `/push/traffic`.
#[derive(Debug, Clone, Serialize)]
pub struct UserTraffic {
    #[serde(rename = "user_id")]
    pub uid: i64,
    pub upload: u64,
    pub download: u64,
    pub count: u64,
}

/// uuid -> user id, refreshed wholesale by the fetch-users task.
#[derive(Default)]
pub struct UserTable {
    by_uuid: DashMap<String, i64>,
}

impl UserTable {
    pub fn new() -> Self {
        UserTable::default()
    }

    /// `auth(uuid) -> (userId, ok)`. Misses return `(-1, false)`.
    pub fn auth(&self, uuid: &str) -> (i64, bool) {
        match self.by_uuid.get(uuid) {
            Some(id) => (*id, true),
            None => (-1, false),
        }
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    fn add_users(&self, users: &[User]) {
        for u in users {
            self.by_uuid.insert(u.uuid.clone(), u.id);
        }
    }

    fn delete_users(&self, users: &[User]) {
        for u in users {
            self.by_uuid.remove(&u.uuid);
        }
    }
}

/// userId -> TrafficItem, drained as a unit by the report-traffic task.
#[derive(Default)]
pub struct TrafficTable {
    by_user: DashMap<i64, Arc<TrafficItem>>,
}

impl TrafficTable {
    pub fn new() -> Self {
        TrafficTable::default()
    }

    /// Returns the traffic item for `user_id`, creating it atomically on
    /// first access. The returned handle may be held past a later `clear()`
    /// -- see spec §9 and DESIGN.md for that tradeoff.
    pub fn get_or_create(&self, user_id: i64) -> Arc<TrafficItem> {
        self.by_user
            .entry(user_id)
            .or_insert_with(|| Arc::new(TrafficItem::new()))
            .clone()
    }

    /// Emits one `UserTraffic` per entry with any nonzero counter.
    pub fn to_user_traffics(&self) -> Vec<UserTraffic> {
        self.by_user
            .iter()
            .filter_map(|entry| {
                let item = entry.value();
                let (up, down, count) = (item.up.value(), item.down.value(), item.count.value());
                if up > 0 || down > 0 || count > 0 {
                    Some(UserTraffic {
                        uid: *entry.key(),
                        upload: up,
                        download: down,
                        count,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Range-deletes every key currently observed. Not atomic with respect
    /// to producers still holding an `Arc<TrafficItem>` from before the
    /// clear -- in-flight adds after the scan passes a key land on a
    /// `TrafficItem` no longer reachable from the table (spec §9).
    pub fn clear(&self) {
        for entry in self.by_user.iter() {
            entry.value().clear();
        }
        self.by_user.clear();
    }
}

/// Computes `(deleted, added)` between the previous and new roster using
/// whole-record equality -- any field changing yields a delete+add pair.
/// O(|prev| + |next|) via two hash sets.
pub fn diff_roster(prev: &[User], next: &[User]) -> (Vec<User>, Vec<User>) {
    let prev_set: HashSet<&User> = prev.iter().collect();
    let next_set: HashSet<&User> = next.iter().collect();

    let deleted = prev_set
        .difference(&next_set)
        .map(|u| (*u).clone())
        .collect();
    let added = next_set
        .difference(&prev_set)
        .map(|u| (*u).clone())
        .collect();
    (deleted, added)
}

/// Applies a `(deleted, added)` diff to the table: deletes first, then adds,
/// so a changed record (delete+add pair for the same uuid) lands on the new
/// value.
pub fn apply_diff(table: &UserTable, deleted: &[User], added: &[User]) {
    table.delete_users(deleted);
    table.add_users(added);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, uuid: &str) -> User {
        User {
            id,
            uuid: uuid.to_string(),
            speed_limit: None,
            device_limit: None,
        }
    }

    #[test]
    fn auth_hits_and_misses() {
        let table = UserTable::new();
        apply_diff(&table, &[], &[user(7, "11111111-1111-1111-1111-111111111111")]);
        assert_eq!(table.auth("11111111-1111-1111-1111-111111111111"), (7, true));
        assert_eq!(table.auth("00000000-0000-0000-0000-000000000000"), (-1, false));
    }

    #[test]
    fn roster_diff_matches_scenario() {
        let prev = vec![user(1, "A"), user(2, "B")];
        let next = vec![user(2, "B"), user(3, "C")];
        let (mut deleted, mut added) = diff_roster(&prev, &next);
        deleted.sort_by_key(|u| u.id);
        added.sort_by_key(|u| u.id);
        assert_eq!(deleted, vec![user(1, "A")]);
        assert_eq!(added, vec![user(3, "C")]);
    }

    #[test]
    fn applying_same_diff_twice_is_a_no_op() {
        let table = UserTable::new();
        let prev: Vec<User> = vec![];
        let next = vec![user(1, "A")];
        let (deleted, added) = diff_roster(&prev, &next);
        apply_diff(&table, &deleted, &added);
        apply_diff(&table, &deleted, &added);
        assert_eq!(table.len(), 1);
        assert_eq!(table.auth("A"), (1, true));
    }

    #[test]
    fn field_change_yields_delete_and_add() {
        let prev = vec![user(1, "A")];
        let next = vec![User {
            id: 1,
            uuid: "A".into(),
            speed_limit: Some(100),
            device_limit: None,
        }];
        let (deleted, added) = diff_roster(&prev, &next);
        assert_eq!(deleted.len(), 1);
        assert_eq!(added.len(), 1);
    }

    #[test]
    fn traffic_drain_then_clear_is_empty() {
        let table = TrafficTable::new();
        let item = table.get_or_create(1);
        item.up.add(10);
        item.down.add(20);
        item.count.add(1);
        assert_eq!(table.to_user_traffics().len(), 1);
        table.clear();
        assert!(table.to_user_traffics().is_empty());
    }

    #[test]
    fn get_or_create_is_idempotent_per_user() {
        let table = TrafficTable::new();
        let a = table.get_or_create(1);
        let b = table.get_or_create(1);
        a.up.add(5);
        assert_eq!(b.up.value(), 5);
    }
}
