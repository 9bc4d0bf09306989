use std::collections::{HashMap, HashSet};

use opslink_proto::{Alert, AssetStatus, TransitRecord};
use uuid::Uuid;

/// Anything that can be diffed by a stable identifier.
pub trait Keyed {
    fn key(&self) -> Uuid;
}

impl Keyed for TransitRecord {
    fn key(&self) -> Uuid {
        self.id
    }
}

impl Keyed for Alert {
    fn key(&self) -> Uuid {
        self.id
    }
}

impl Keyed for AssetStatus {
    fn key(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListDiff<T> {
    pub added: Vec<T>,
    pub updated: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> ListDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Diff two snapshots by id. An item counts as updated only when its
/// contents changed; identical items in both snapshots produce nothing.
pub fn diff_by_id<T>(old: &[T], new: &[T]) -> ListDiff<T>
where
    T: Keyed + PartialEq + Clone,
{
    let old_by_id: HashMap<Uuid, &T> = old.iter().map(|item| (item.key(), item)).collect();
    let new_ids: HashSet<Uuid> = new.iter().map(|item| item.key()).collect();

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for item in new {
        match old_by_id.get(&item.key()) {
            None => added.push(item.clone()),
            Some(previous) if *previous != item => updated.push(item.clone()),
            Some(_) => {}
        }
    }
    let removed = old
        .iter()
        .filter(|item| !new_ids.contains(&item.key()))
        .cloned()
        .collect();

    ListDiff {
        added,
        updated,
        removed,
    }
}
