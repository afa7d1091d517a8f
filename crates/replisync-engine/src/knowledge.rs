//! Version vectors describing which changes a replica has incorporated.
//!
//! A [`Knowledge`] is a base clock (replica -> highest tick) plus two kinds
//! of exceptions: range exceptions, whose clock only holds for a contiguous
//! span of global ids, and item exceptions, whose clock only holds for one
//! id. Clocks are keyed by [`ReplicaIdentity`]; the [`ReplicaKeyMap`] gives
//! each replica the compact `u32` key used inside [`Version`]s.
//!
//! Containment is the union of base and exceptions, and every exception
//! entry already implied by the base is pruned, so [`Knowledge::combine`] is
//! commutative and idempotent up to [`Knowledge::equivalent`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::SyncError;
use crate::id::{GlobalId, ReplicaIdentity};

/// Replica key of the knowledge owner.
pub const OWNER_KEY: u32 = 0;

/// A change version in some knowledge's replica-key space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Index into the owning knowledge's [`ReplicaKeyMap`].
    pub replica_key: u32,
    /// Logical tick on that replica.
    pub tick: u64,
}

impl Version {
    /// Creates a version.
    pub fn new(replica_key: u32, tick: u64) -> Self {
        Self { replica_key, tick }
    }

    /// Version produced by the knowledge owner itself.
    pub fn local(tick: u64) -> Self {
        Self::new(OWNER_KEY, tick)
    }
}

/// Dense numbering of the replicas a knowledge has heard of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaKeyMap {
    replicas: Vec<ReplicaIdentity>,
}

impl ReplicaKeyMap {
    /// Creates a map whose key 0 is `owner`.
    pub fn new(owner: ReplicaIdentity) -> Self {
        Self {
            replicas: vec![owner],
        }
    }

    /// Key of a known replica.
    pub fn lookup_key(&self, replica: &ReplicaIdentity) -> Option<u32> {
        self.replicas
            .iter()
            .position(|r| r == replica)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Identity behind a key.
    pub fn identity(&self, key: u32) -> Option<&ReplicaIdentity> {
        self.replicas.get(key as usize)
    }

    /// Returns the key of `replica`, assigning the next free one if needed.
    pub fn get_or_insert(&mut self, replica: ReplicaIdentity) -> Result<u32, SyncError> {
        if let Some(key) = self.lookup_key(&replica) {
            return Ok(key);
        }
        let key = next_key(self.replicas.len())?;
        self.replicas.push(replica);
        Ok(key)
    }

    /// All replicas in key order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicaIdentity> {
        self.replicas.iter()
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Always false: the owner is always present.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

fn next_key(len: usize) -> Result<u32, SyncError> {
    u32::try_from(len).map_err(|_| SyncError::ReplicaKeysExhausted)
}

/// Replica -> highest incorporated tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockVector(BTreeMap<ReplicaIdentity, u64>);

impl ClockVector {
    /// Empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick for `replica`, 0 if absent.
    pub fn get(&self, replica: &ReplicaIdentity) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Raises the entry for `replica` to at least `tick`.
    pub fn raise(&mut self, replica: ReplicaIdentity, tick: u64) {
        if tick == 0 {
            return;
        }
        let entry = self.0.entry(replica).or_insert(0);
        *entry = (*entry).max(tick);
    }

    /// Point-wise maximum.
    pub fn merge(&mut self, other: &ClockVector) {
        for (replica, tick) in &other.0 {
            self.raise(*replica, *tick);
        }
    }

    /// True if every entry of `other` is <= the matching entry here.
    pub fn dominates(&self, other: &ClockVector) -> bool {
        other.0.iter().all(|(r, t)| self.get(r) >= *t)
    }

    /// Drops entries already implied by `base`.
    fn prune_against(&mut self, base: &ClockVector) {
        self.0.retain(|r, t| *t > base.get(r));
    }

    /// Iterates `(replica, tick)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaIdentity, &u64)> {
        self.0.iter()
    }

    /// True if no replica has a non-zero entry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A clock that only holds for ids in `[lower, upper]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeException {
    /// Inclusive lower bound.
    pub lower: GlobalId,
    /// Inclusive upper bound.
    pub upper: GlobalId,
    /// Clock valid inside the range.
    pub clock: ClockVector,
}

impl RangeException {
    fn covers(&self, id: &GlobalId) -> bool {
        self.lower <= *id && *id <= self.upper
    }
}

/// Version vector plus range and item exceptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Knowledge {
    key_map: ReplicaKeyMap,
    base: ClockVector,
    ranges: Vec<RangeException>,
    items: BTreeMap<GlobalId, ClockVector>,
}

impl Knowledge {
    /// Empty knowledge owned by `owner`.
    pub fn new(owner: ReplicaIdentity) -> Self {
        Self {
            key_map: ReplicaKeyMap::new(owner),
            base: ClockVector::new(),
            ranges: Vec::new(),
            items: BTreeMap::new(),
        }
    }

    /// Knowledge with this key map and nothing known.
    pub fn empty_like(&self) -> Self {
        Self {
            key_map: self.key_map.clone(),
            base: ClockVector::new(),
            ranges: Vec::new(),
            items: BTreeMap::new(),
        }
    }

    /// Replica owning this knowledge.
    pub fn owner(&self) -> ReplicaIdentity {
        // Key 0 is assigned at construction and never removed.
        self.key_map.replicas[OWNER_KEY as usize]
    }

    /// The replica key map.
    pub fn key_map(&self) -> &ReplicaKeyMap {
        &self.key_map
    }

    /// Base clock.
    pub fn base(&self) -> &ClockVector {
        &self.base
    }

    /// Range exceptions, sorted by bounds.
    pub fn ranges(&self) -> &[RangeException] {
        &self.ranges
    }

    /// Item exceptions.
    pub fn items(&self) -> &BTreeMap<GlobalId, ClockVector> {
        &self.items
    }

    /// Highest tick of the owner known here.
    pub fn local_tick(&self) -> u64 {
        self.base.get(&self.owner())
    }

    /// Raises the owner's own entry to `tick`.
    pub fn set_local_tick(&mut self, tick: u64) {
        let owner = self.owner();
        self.base.raise(owner, tick);
    }

    /// True if the change `origin@tick` of item `id` is incorporated.
    pub fn contains(&self, origin: &ReplicaIdentity, id: &GlobalId, tick: u64) -> bool {
        if self.base.get(origin) >= tick {
            return true;
        }
        if self
            .ranges
            .iter()
            .any(|r| r.covers(id) && r.clock.get(origin) >= tick)
        {
            return true;
        }
        self.items
            .get(id)
            .map_or(false, |clock| clock.get(origin) >= tick)
    }

    /// [`Knowledge::contains`] for a version in this knowledge's key space.
    pub fn contains_version(&self, id: &GlobalId, version: &Version) -> bool {
        match self.key_map.identity(version.replica_key) {
            Some(origin) => self.contains(origin, id, version.tick),
            None => false,
        }
    }

    /// Replica and tick behind a version in this key space.
    pub fn resolve_version(&self, version: &Version) -> Option<(ReplicaIdentity, u64)> {
        self.key_map
            .identity(version.replica_key)
            .map(|r| (*r, version.tick))
    }

    /// Version of `replica@tick` in this key space, registering the replica.
    pub fn local_version(&mut self, replica: ReplicaIdentity, tick: u64) -> Result<Version, SyncError> {
        Ok(Version::new(self.key_map.get_or_insert(replica)?, tick))
    }

    /// Rewrites a version expressed in `remote`'s key space into this one.
    pub fn translate(&mut self, remote: &Knowledge, version: Version) -> Result<Version, SyncError> {
        let (replica, tick) = remote
            .resolve_version(&version)
            .ok_or(SyncError::UnknownReplicaKey(version.replica_key))?;
        self.local_version(replica, tick)
    }

    /// Copy of `remote` whose key map extends this knowledge's key map, so
    /// local versions can be tested against it directly.
    pub fn map_remote_to_local(&self, remote: &Knowledge) -> Result<Knowledge, SyncError> {
        let mut key_map = self.key_map.clone();
        for replica in remote.key_map.iter() {
            key_map.get_or_insert(*replica)?;
        }
        Ok(Knowledge {
            key_map,
            base: remote.base.clone(),
            ranges: remote.ranges.clone(),
            items: remote.items.clone(),
        })
    }

    /// Merges `other` into this knowledge.
    pub fn combine(&mut self, other: &Knowledge) -> Result<(), SyncError> {
        for replica in other.key_map.iter() {
            self.key_map.get_or_insert(*replica)?;
        }
        self.base.merge(&other.base);
        self.ranges.extend(other.ranges.iter().cloned());
        for (id, clock) in &other.items {
            self.items.entry(*id).or_default().merge(clock);
        }
        self.normalize();
        Ok(())
    }

    /// What this knowledge says about ids in `[lower, upper]`, as a range exception.
    pub fn project_range(&self, lower: GlobalId, upper: GlobalId) -> Knowledge {
        let mut projected = self.empty_like();
        if lower > upper {
            return projected;
        }
        projected.ranges.push(RangeException {
            lower,
            upper,
            clock: self.base.clone(),
        });
        for range in &self.ranges {
            let lo = range.lower.max(lower);
            let hi = range.upper.min(upper);
            if lo <= hi {
                projected.ranges.push(RangeException {
                    lower: lo,
                    upper: hi,
                    clock: range.clock.clone(),
                });
            }
        }
        for (id, clock) in self.items.range(lower..=upper) {
            projected.items.insert(*id, clock.clone());
        }
        projected.normalize();
        projected
    }

    /// What this knowledge says about a single id, as an item exception.
    pub fn project_item(&self, id: &GlobalId) -> Knowledge {
        let mut clock = self.base.clone();
        for range in self.ranges.iter().filter(|r| r.covers(id)) {
            clock.merge(&range.clock);
        }
        if let Some(item) = self.items.get(id) {
            clock.merge(item);
        }
        let mut projected = self.empty_like();
        if !clock.is_empty() {
            projected.items.insert(*id, clock);
        }
        projected
    }

    /// Number of range plus item exceptions.
    pub fn exception_count(&self) -> usize {
        self.ranges.len() + self.items.len()
    }

    /// Moves exceptions beyond `max_exceptions` into `forgotten`.
    ///
    /// Items covered only by a dropped exception become unknown again and
    /// will be resent by the next source.
    pub fn compact_into(
        &mut self,
        forgotten: &mut ForgottenKnowledge,
        max_exceptions: usize,
    ) -> Result<usize, SyncError> {
        let mut dropped = self.empty_like();
        let mut count = 0;
        while self.exception_count() > max_exceptions {
            if let Some((id, clock)) = self.items.pop_first() {
                dropped.items.insert(id, clock);
            } else if let Some(range) = self.ranges.pop() {
                dropped.ranges.push(range);
            } else {
                break;
            }
            count += 1;
        }
        if count > 0 {
            forgotten.forget(&dropped)?;
            debug!(dropped = count, remaining = self.exception_count(), "knowledge compacted");
        }
        Ok(count)
    }

    /// True if everything `other` knows is known here.
    pub fn covers(&self, other: &Knowledge) -> bool {
        let base_ok = other
            .base
            .iter()
            .all(|(r, t)| self.base.get(r) >= *t);
        let ranges_ok = other.ranges.iter().all(|range| {
            range.clock.iter().all(|(r, t)| {
                self.contains(r, &range.lower, *t) && self.contains(r, &range.upper, *t)
            })
        });
        let items_ok = other
            .items
            .iter()
            .all(|(id, clock)| clock.iter().all(|(r, t)| self.contains(r, id, *t)));
        base_ok && ranges_ok && items_ok
    }

    /// Same clocks and exceptions, ignoring key numbering.
    pub fn equivalent(&self, other: &Knowledge) -> bool {
        self.base == other.base && self.ranges == other.ranges && self.items == other.items
    }

    /// Serializes with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes bytes written by [`Knowledge::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let knowledge: Knowledge = bincode::deserialize(bytes)?;
        if knowledge.key_map.is_empty() {
            return Err(SyncError::Format("knowledge without owner".to_string()));
        }
        Ok(knowledge)
    }

    fn normalize(&mut self) {
        let mut items = std::mem::take(&mut self.items);
        items.retain(|_, clock| {
            clock.prune_against(&self.base);
            !clock.is_empty()
        });

        let mut grouped: BTreeMap<ClockVector, Vec<(u128, u128)>> = BTreeMap::new();
        for mut range in std::mem::take(&mut self.ranges) {
            range.clock.prune_against(&self.base);
            if range.clock.is_empty() || range.lower > range.upper {
                continue;
            }
            grouped
                .entry(range.clock)
                .or_default()
                .push((range.lower.as_u128(), range.upper.as_u128()));
        }

        let mut ranges = Vec::new();
        for (clock, mut spans) in grouped {
            spans.sort_unstable();
            let mut merged: Vec<(u128, u128)> = Vec::with_capacity(spans.len());
            for (lo, hi) in spans {
                match merged.last_mut() {
                    Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
                    _ => merged.push((lo, hi)),
                }
            }
            for (lo, hi) in merged {
                ranges.push(RangeException {
                    lower: GlobalId::from_u128(lo),
                    upper: GlobalId::from_u128(hi),
                    clock: clock.clone(),
                });
            }
        }
        ranges.sort_by(|a, b| {
            (a.lower, a.upper)
                .cmp(&(b.lower, b.upper))
                .then_with(|| a.clock.cmp(&b.clock))
        });

        self.ranges = ranges;
        self.items = items;
    }
}

/// Knowledge compacted out of a replica's current knowledge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgottenKnowledge {
    knowledge: Knowledge,
}

impl ForgottenKnowledge {
    /// Nothing forgotten yet.
    pub fn new(owner: ReplicaIdentity) -> Self {
        Self {
            knowledge: Knowledge::new(owner),
        }
    }

    /// Records knowledge that was dropped.
    pub fn forget(&mut self, dropped: &Knowledge) -> Result<(), SyncError> {
        self.knowledge.combine(dropped)
    }

    /// True if `origin@tick` of `id` was known at some point and forgotten.
    pub fn contains(&self, origin: &ReplicaIdentity, id: &GlobalId, tick: u64) -> bool {
        self.knowledge.contains(origin, id, tick)
    }

    /// The forgotten clocks as a knowledge.
    pub fn knowledge(&self) -> &Knowledge {
        &self.knowledge
    }

    /// True if nothing was ever forgotten.
    pub fn is_empty(&self) -> bool {
        self.knowledge.base.is_empty() && self.knowledge.exception_count() == 0
    }

    /// Serializes with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes bytes written by [`ForgottenKnowledge::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas() -> (ReplicaIdentity, ReplicaIdentity) {
        (ReplicaIdentity::generate(), ReplicaIdentity::generate())
    }

    #[test]
    fn test_base_containment() {
        let (a, b) = replicas();
        let mut k = Knowledge::new(a);
        k.set_local_tick(5);
        let id = GlobalId::for_replica(1, &a, 3);
        assert!(k.contains(&a, &id, 5));
        assert!(!k.contains(&a, &id, 6));
        assert!(!k.contains(&b, &id, 1));
        assert!(k.contains_version(&id, &Version::local(4)));
        assert_eq!(k.local_tick(), 5);
    }

    #[test]
    fn test_range_exception_only_covers_its_span() {
        let (a, b) = replicas();
        let mut source = Knowledge::new(b);
        source.set_local_tick(10);
        let learned = source.project_range(GlobalId::lower_bound(1), GlobalId::upper_bound(1));

        let mut k = Knowledge::new(a);
        k.combine(&learned).unwrap();
        assert!(k.contains(&b, &GlobalId::new(1, 7, 9), 10));
        assert!(!k.contains(&b, &GlobalId::new(2, 7, 9), 10));
        assert_eq!(k.ranges().len(), 1);
    }

    #[test]
    fn test_item_exception() {
        let (a, b) = replicas();
        let mut source = Knowledge::new(b);
        source.set_local_tick(4);
        let id = GlobalId::for_replica(2, &b, 4);
        let mut k = Knowledge::new(a);
        k.combine(&source.project_item(&id)).unwrap();
        assert!(k.contains(&b, &id, 4));
        assert!(!k.contains(&b, &GlobalId::for_replica(2, &b, 3), 1));
    }

    #[test]
    fn test_exceptions_pruned_by_base() {
        let (a, b) = replicas();
        let mut source = Knowledge::new(b);
        source.set_local_tick(3);
        let mut k = Knowledge::new(a);
        k.combine(&source.project_range(GlobalId::lower_bound(1), GlobalId::upper_bound(1))).unwrap();
        assert_eq!(k.exception_count(), 1);

        let mut newer = Knowledge::new(b);
        newer.set_local_tick(8);
        k.combine(&newer).unwrap();
        assert_eq!(k.exception_count(), 0);
        assert!(k.contains(&b, &GlobalId::lower_bound(5), 8));
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let (a, b) = replicas();
        let mut source = Knowledge::new(b);
        source.set_local_tick(2);
        let first = source.project_range(GlobalId::new(1, 0, 0), GlobalId::new(1, 0, 9));
        let second = source.project_range(GlobalId::new(1, 0, 10), GlobalId::upper_bound(1));
        let mut k = Knowledge::new(a);
        k.combine(&first).unwrap();
        k.combine(&second).unwrap();
        assert_eq!(k.ranges().len(), 1);
        assert_eq!(k.ranges()[0].lower, GlobalId::new(1, 0, 0));
        assert_eq!(k.ranges()[0].upper, GlobalId::upper_bound(1));
    }

    #[test]
    fn test_combine_is_commutative_and_idempotent() {
        let (a, b) = replicas();
        let mut x = Knowledge::new(a);
        x.set_local_tick(3);
        let mut y = Knowledge::new(b);
        y.set_local_tick(7);
        let y_range = y.project_range(GlobalId::new(1, 0, 0), GlobalId::new(1, 0, 50));

        let mut left = x.clone();
        left.combine(&y_range).unwrap();
        let mut right = y_range.clone();
        right.combine(&x).unwrap();
        assert!(left.equivalent(&right));

        let mut twice = left.clone();
        twice.combine(&left).unwrap();
        assert!(twice.equivalent(&left));
    }

    #[test]
    fn test_key_map_assigns_dense_keys() {
        let (a, b) = replicas();
        let mut map = ReplicaKeyMap::new(a);
        assert_eq!(map.get_or_insert(b).unwrap(), 1);
        assert_eq!(map.get_or_insert(b).unwrap(), 1);
        assert_eq!(map.get_or_insert(a).unwrap(), OWNER_KEY);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_key_space_overflow_is_an_error() {
        assert_eq!(next_key(7).unwrap(), 7);
        assert_eq!(next_key(u32::MAX as usize).unwrap(), u32::MAX);
        if let Ok(past_end) = usize::try_from(u64::from(u32::MAX) + 1) {
            assert!(matches!(next_key(past_end), Err(SyncError::ReplicaKeysExhausted)));
        }
    }

    #[test]
    fn test_map_remote_and_translate() {
        let (a, b) = replicas();
        let mut remote = Knowledge::new(b);
        remote.set_local_tick(6);
        let local = Knowledge::new(a);
        let mapped = local.map_remote_to_local(&remote).unwrap();
        assert_eq!(mapped.key_map().lookup_key(&a), Some(0));
        let b_key = mapped.key_map().lookup_key(&b).unwrap();
        let id = GlobalId::for_replica(1, &b, 6);
        assert!(mapped.contains_version(&id, &Version::new(b_key, 6)));

        let mut local = local;
        let translated = local.translate(&remote, Version::local(6)).unwrap();
        assert_eq!(local.resolve_version(&translated), Some((b, 6)));
        assert!(matches!(
            local.translate(&remote, Version::new(9, 1)),
            Err(SyncError::UnknownReplicaKey(9))
        ));
    }

    #[test]
    fn test_compaction_moves_exceptions_to_forgotten() {
        let (a, b) = replicas();
        let mut source = Knowledge::new(b);
        source.set_local_tick(5);
        let mut k = Knowledge::new(a);
        for tick in 1..=4 {
            k.combine(&source.project_item(&GlobalId::for_replica(1, &b, tick))).unwrap();
        }
        assert_eq!(k.exception_count(), 4);

        let mut forgotten = ForgottenKnowledge::new(a);
        assert!(forgotten.is_empty());
        assert_eq!(k.compact_into(&mut forgotten, 2).unwrap(), 2);
        assert_eq!(k.exception_count(), 2);
        let first = GlobalId::for_replica(1, &b, 1);
        assert!(!k.contains(&b, &first, 5));
        assert!(forgotten.contains(&b, &first, 5));
        assert!(!k.covers(forgotten.knowledge()));
    }

    #[test]
    fn test_bytes_round_trip() {
        let (a, b) = replicas();
        let mut k = Knowledge::new(a);
        k.set_local_tick(2);
        let mut other = Knowledge::new(b);
        other.set_local_tick(9);
        k.combine(&other.project_item(&GlobalId::new(1, 1, 1))).unwrap();
        let back = Knowledge::from_bytes(&k.to_bytes().unwrap()).unwrap();
        assert_eq!(back, k);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn learned(owner: ReplicaIdentity, sources: &[Knowledge], picks: &[(usize, u64)]) -> Knowledge {
            let mut k = Knowledge::new(owner);
            for (source, tick) in picks {
                let source = &sources[source % sources.len()];
                let id = GlobalId::for_replica(1, &source.owner(), *tick);
                k.combine(&source.project_item(&id)).unwrap();
            }
            k
        }

        fn picks() -> impl Strategy<Value = Vec<(usize, u64)>> {
            prop::collection::vec((0usize..2, 1u64..40), 0..12)
        }

        proptest! {
            #[test]
            fn prop_combine_commutes(left in picks(), right in picks()) {
                let owner = ReplicaIdentity::generate();
                let sources: Vec<Knowledge> = (0..2)
                    .map(|i| {
                        let mut k = Knowledge::new(ReplicaIdentity::generate());
                        k.set_local_tick(10 + i * 20);
                        k
                    })
                    .collect();
                let l = learned(owner, &sources, &left);
                let r = learned(owner, &sources, &right);
                let mut lr = l.clone();
                lr.combine(&r).unwrap();
                let mut rl = r.clone();
                rl.combine(&l).unwrap();
                prop_assert!(lr.equivalent(&rl));
                prop_assert!(lr.covers(&l) && lr.covers(&r));
            }

            #[test]
            fn prop_combine_idempotent(items in picks()) {
                let owner = ReplicaIdentity::generate();
                let mut source = Knowledge::new(ReplicaIdentity::generate());
                source.set_local_tick(25);
                let k = learned(owner, &[source], &items);
                let mut twice = k.clone();
                twice.combine(&k).unwrap();
                prop_assert!(twice.equivalent(&k));
            }

            #[test]
            fn prop_range_projection_is_bounded(lower in 1u64..30, len in 0u64..30, point in 1u64..80) {
                let mut source = Knowledge::new(ReplicaIdentity::generate());
                source.set_local_tick(100);
                let origin = source.owner();
                let lo = GlobalId::for_replica(1, &origin, lower);
                let hi = GlobalId::for_replica(1, &origin, lower + len);
                let projected = source.project_range(lo, hi);
                let id = GlobalId::for_replica(1, &origin, point);
                let inside = point >= lower && point <= lower + len;
                prop_assert_eq!(projected.contains(&origin, &id, 100), inside);
            }
        }
    }
}
