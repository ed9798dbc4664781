//! Copy-on-write containers behind the graph snapshot.
//!
//! Each container is split into [`SHARDS`] `Arc`-shared pieces. Cloning copies
//! the shard pointers only; the first write to a shard after a clone copies
//! that shard (its keys plus `Arc` handles to the values), and writing a value
//! copies just that value. A commit therefore pays for the shards it touches,
//! not for the whole graph.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher, Hash};
use std::sync::Arc;

use crate::graph::types::NoteId;

pub const SHARDS: usize = 64;

fn shard_of<K: Hash + ?Sized>(key: &K) -> usize {
    // Fixed-key hasher so shard placement is stable across snapshots.
    let hash = BuildHasherDefault::<DefaultHasher>::default().hash_one(key);
    (hash % SHARDS as u64) as usize
}

pub struct ShardedMap<K, V> {
    shards: Vec<Arc<HashMap<K, Arc<V>>>>,
}

impl<K, V> Clone for ShardedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
        }
    }
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(HashMap::new())).collect(),
        }
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.shards.iter().flat_map(|s| s.iter()))
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<&V> {
        self.shards[shard_of(key)].get(key).map(Arc::as_ref)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shards[shard_of(key)].contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.shards.iter().flat_map(|s| s.values().map(Arc::as_ref))
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.shard_mut(&key).insert(key, Arc::new(value));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.contains_key(key) {
            return None;
        }
        self.shard_mut(key).remove(key).map(Arc::unwrap_or_clone)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.contains_key(key) {
            return None;
        }
        self.shard_mut(key).get_mut(key).map(Arc::make_mut)
    }

    pub fn get_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        Arc::make_mut(self.shard_mut(&key).entry(key).or_default())
    }

    fn shard_mut(&mut self, key: &K) -> &mut HashMap<K, Arc<V>> {
        Arc::make_mut(&mut self.shards[shard_of(key)])
    }
}

/// Active notes ordered by next review, sharded by note id.
#[derive(Clone)]
pub struct ReviewQueue {
    shards: Vec<Arc<BTreeSet<(DateTime<Utc>, NoteId)>>>,
}

impl Default for ReviewQueue {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(BTreeSet::new())).collect(),
        }
    }
}

impl std::fmt::Debug for ReviewQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewQueue")
            .field("len", &self.shards.iter().map(|s| s.len()).sum::<usize>())
            .finish()
    }
}

impl ReviewQueue {
    pub fn insert(&mut self, at: DateTime<Utc>, id: NoteId) {
        Arc::make_mut(&mut self.shards[shard_of(&id)]).insert((at, id));
    }

    pub fn remove(&mut self, at: DateTime<Utc>, id: &NoteId) {
        let shard = &mut self.shards[shard_of(id)];
        let entry = (at, id.clone());
        if shard.contains(&entry) {
            Arc::make_mut(shard).remove(&entry);
        }
    }

    /// Up to `limit` entries due at `now`, earliest first, ties by id.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<NoteId> {
        let mut due: Vec<&(DateTime<Utc>, NoteId)> = self
            .shards
            .iter()
            .flat_map(|s| s.iter().take_while(|(at, _)| *at <= now).take(limit))
            .collect();
        due.sort();
        due.into_iter().take(limit).map(|(_, id)| id.clone()).collect()
    }

    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.shards
            .iter()
            .map(|s| s.iter().take_while(|(at, _)| *at <= now).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_untouched_shards() {
        let mut base: ShardedMap<String, Vec<f32>> = ShardedMap::default();
        for i in 0..500 {
            base.insert(format!("note-{i}"), vec![i as f32; 8]);
        }
        let mut next = base.clone();
        next.get_mut(&"note-7".to_string()).unwrap()[0] = -1.0;

        let shared = base
            .shards
            .iter()
            .zip(&next.shards)
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count();
        assert_eq!(shared, SHARDS - 1);
        assert_eq!(base.get(&"note-7".to_string()).unwrap()[0], 7.0);
        assert_eq!(next.get(&"note-7".to_string()).unwrap()[0], -1.0);
        assert_eq!(next.len(), 500);
    }

    #[test]
    fn remove_and_default_entries() {
        let mut map: ShardedMap<String, BTreeSet<u32>> = ShardedMap::default();
        map.get_or_default("a".into()).insert(1);
        map.get_or_default("a".into()).insert(2);
        assert_eq!(map.get(&"a".to_string()).map(|s| s.len()), Some(2));
        assert_eq!(map.remove(&"a".to_string()).map(|s| s.len()), Some(2));
        assert!(map.remove(&"a".to_string()).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn review_queue_merges_shards_in_time_order() {
        let now = Utc::now();
        let mut queue = ReviewQueue::default();
        let ids: Vec<NoteId> = (0..40).map(|i| NoteId::from(format!("n{i:02}"))).collect();
        for (i, id) in ids.iter().enumerate() {
            queue.insert(now - chrono::Duration::minutes(i as i64), id.clone());
        }
        queue.insert(now + chrono::Duration::hours(1), NoteId::from("later"));

        let due = queue.due(now, 3);
        assert_eq!(due, vec![ids[39].clone(), ids[38].clone(), ids[37].clone()]);
        assert_eq!(queue.due_count(now), 40);

        queue.remove(now - chrono::Duration::minutes(39), &ids[39]);
        assert_eq!(queue.due(now, 1), vec![ids[38].clone()]);
    }
}
