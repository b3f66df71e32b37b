//! Pure merge rules for collections and timestamps.

use crate::types::Timestamp;
use lcmdb_codec::ObjectId;

/// Result of a three-way collection merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMerge {
    /// Value both sides agree on.
    pub merged: Vec<ObjectId>,
    /// Items only the foreign side added.
    pub foreign_added: Vec<ObjectId>,
    /// Items only the foreign side removed.
    pub foreign_deleted: Vec<ObjectId>,
}

fn minus(from: &[ObjectId], remove: &[ObjectId]) -> Vec<ObjectId> {
    from.iter().filter(|id| !remove.contains(id)).copied().collect()
}

/// Drops repeated items, keeping the first occurrence.
#[must_use]
pub fn dedupe(items: Vec<ObjectId>) -> Vec<ObjectId> {
    let mut out: Vec<ObjectId> = Vec::with_capacity(items.len());
    for id in items {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Merges a locally and a foreign edited collection against their common
/// `base`.
///
/// The merged value is the foreign value minus what the local side removed,
/// followed by what the local side added. Items both sides added or both
/// removed count once.
#[must_use]
pub fn three_way(base: &[ObjectId], local: &[ObjectId], foreign: &[ObjectId]) -> CollectionMerge {
    let local_added = minus(local, base);
    let local_deleted = minus(base, local);
    let foreign_added = minus(&minus(foreign, local), &local_deleted);
    let foreign_deleted = minus(&minus(local, foreign), &local_added);

    let mut merged = minus(foreign, &local_deleted);
    merged.extend(local_added.iter().copied());
    CollectionMerge {
        merged: dedupe(merged),
        foreign_added: dedupe(foreign_added),
        foreign_deleted: dedupe(foreign_deleted),
    }
}

/// Rewrites one side of a local record so it stays valid on top of the
/// foreign edit.
#[must_use]
pub fn rebase(values: &[ObjectId], foreign_added: &[ObjectId], foreign_deleted: &[ObjectId]) -> Vec<ObjectId> {
    let mut out = minus(values, foreign_deleted);
    out.extend(minus(foreign_added, values));
    dedupe(out)
}

/// What to do with a `DateModified` value another client also wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMerge {
    /// The local value is newer. Local records are clamped so undo never
    /// goes below the foreign value.
    KeepLocal {
        /// Lower bound for local `old` values.
        floor: Timestamp,
    },
    /// The foreign value is newer and replaces the local one.
    TakeForeign,
}

/// Decides between the visible local timestamp and the foreign one.
#[must_use]
pub fn merge_timestamp(local: Timestamp, foreign: Timestamp) -> TimestampMerge {
    if local >= foreign {
        TimestampMerge::KeepLocal { floor: foreign }
    } else {
        TimestampMerge::TakeForeign
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn ids(n: usize) -> Vec<ObjectId> {
        (0..n).map(|_| ObjectId::new()).collect()
    }

    fn set(items: &[ObjectId]) -> BTreeSet<ObjectId> {
        items.iter().copied().collect()
    }

    #[test]
    fn merges_disjoint_edits() {
        let p = ids(4);
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        let merge = three_way(&[a, b], &[a, c], &[b, d]);
        assert_eq!(set(&merge.merged), set(&[c, d]));
        assert_eq!(merge.foreign_added, vec![d]);
        assert_eq!(merge.foreign_deleted, vec![a]);

        // Local record {A,B} -> {A,C} becomes {B,D} -> {C,D}.
        assert_eq!(set(&rebase(&[a, b], &merge.foreign_added, &merge.foreign_deleted)), set(&[b, d]));
        assert_eq!(set(&rebase(&[a, c], &merge.foreign_added, &merge.foreign_deleted)), set(&[c, d]));
    }

    #[test]
    fn shared_additions_count_once() {
        let p = ids(2);
        let merge = three_way(&[], &[p[0]], &[p[0], p[1]]);
        assert_eq!(merge.merged, vec![p[0], p[1]]);
        assert_eq!(merge.foreign_added, vec![p[1]]);
    }

    #[test]
    fn timestamp_merge_prefers_newer() {
        let t1 = Timestamp::from_millis(100);
        let t2 = Timestamp::from_millis(200);
        assert_eq!(merge_timestamp(t2, t1), TimestampMerge::KeepLocal { floor: t1 });
        assert_eq!(merge_timestamp(t1, t2), TimestampMerge::TakeForeign);
        assert_eq!(merge_timestamp(t1, t1), TimestampMerge::KeepLocal { floor: t1 });
    }

    fn pick(pool: &[ObjectId], mask: u16) -> Vec<ObjectId> {
        pool.iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, id)| *id)
            .collect()
    }

    proptest! {
        #[test]
        fn merge_keeps_both_sides(base in 0u16..256, local in 0u16..256, foreign in 0u16..256) {
            let pool = ids(8);
            let (base, local, foreign) = (pick(&pool, base), pick(&pool, local), pick(&pool, foreign));
            let merge = three_way(&base, &local, &foreign);
            let merged = set(&merge.merged);

            for id in minus(&local, &base) {
                prop_assert!(merged.contains(&id));
            }
            for id in minus(&base, &local) {
                prop_assert!(!merged.contains(&id));
            }
            for id in minus(&foreign, &base) {
                prop_assert!(merged.contains(&id));
            }
            prop_assert_eq!(merge.merged.len(), merged.len());
        }

        #[test]
        fn merging_again_changes_nothing(base in 0u16..256, local in 0u16..256, foreign in 0u16..256) {
            let pool = ids(8);
            let (base, local, foreign) = (pick(&pool, base), pick(&pool, local), pick(&pool, foreign));
            let first = three_way(&base, &local, &foreign);
            let rebased_base = rebase(&base, &first.foreign_added, &first.foreign_deleted);
            let second = three_way(&rebased_base, &first.merged, &foreign);
            prop_assert_eq!(set(&second.merged), set(&first.merged));
            prop_assert!(second.foreign_added.is_empty());
        }
    }
}
