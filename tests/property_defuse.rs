//! Property tests for the def-use primitives.

use proptest::prelude::*;

use flowlog::defuse::{replace_all_uses_with, replace_uses_where, Arena, UseList};

proptest! {
    /// Use lists yield entries in insertion order.
    #[test]
    fn prop_use_list_preserves_insertion_order(entries in prop::collection::vec((0u32..16, 0usize..8), 0..64)) {
        let mut uses: UseList<u32> = UseList::new();
        for &(user, slot) in &entries {
            uses.add(user, slot);
        }
        let observed: Vec<(u32, usize)> = uses.iter().map(|u| (u.user, u.slot)).collect();
        prop_assert_eq!(observed, entries);
    }

    /// After replace-all, the old list is empty and the new list gained the
    /// entries at its tail in their original order.
    #[test]
    fn prop_replace_all_moves_in_order(
        old_entries in prop::collection::vec((0u32..16, 0usize..8), 0..32),
        new_entries in prop::collection::vec((16u32..32, 0usize..8), 0..32),
    ) {
        let mut old: UseList<u32> = UseList::new();
        let mut new: UseList<u32> = UseList::new();
        for &(user, slot) in &old_entries {
            old.add(user, slot);
        }
        for &(user, slot) in &new_entries {
            new.add(user, slot);
        }

        let mut notified = Vec::new();
        replace_all_uses_with(&mut old, &mut new, |u| notified.push((u.user, u.slot)));

        prop_assert!(old.is_empty());
        prop_assert_eq!(&notified, &old_entries);
        let observed: Vec<(u32, usize)> = new.iter().map(|u| (u.user, u.slot)).collect();
        let mut expected = new_entries.clone();
        expected.extend(old_entries);
        prop_assert_eq!(observed, expected);
    }

    /// Filtered replacement partitions the old list without reordering
    /// either side.
    #[test]
    fn prop_replace_where_partitions(
        entries in prop::collection::vec((0u32..8, 0usize..4), 0..32),
        threshold in 0u32..8,
    ) {
        let mut old: UseList<u32> = UseList::new();
        let mut new: UseList<u32> = UseList::new();
        for &(user, slot) in &entries {
            old.add(user, slot);
        }

        replace_uses_where(&mut old, &mut new, |user| user < threshold, |_| {});

        let kept: Vec<(u32, usize)> = old.iter().map(|u| (u.user, u.slot)).collect();
        let moved: Vec<(u32, usize)> = new.iter().map(|u| (u.user, u.slot)).collect();
        let expected_kept: Vec<(u32, usize)> =
            entries.iter().copied().filter(|&(u, _)| u >= threshold).collect();
        let expected_moved: Vec<(u32, usize)> =
            entries.iter().copied().filter(|&(u, _)| u < threshold).collect();
        prop_assert_eq!(kept, expected_kept);
        prop_assert_eq!(moved, expected_moved);

        // Moving everything back restores the original multiset, in old
        // order followed by nothing new.
        prop_assert_eq!(old.len() + new.len(), entries.len());
    }

    /// Arena ids stay dead after removal even when slots are reused.
    #[test]
    fn prop_arena_generations(ops in prop::collection::vec(0u8..3, 1..64)) {
        let mut arena: Arena<u64> = Arena::new();
        let mut live = Vec::new();
        let mut dead = Vec::new();
        let mut counter = 0u64;

        for op in ops {
            match op {
                // alloc
                0 => {
                    counter += 1;
                    live.push((arena.alloc(counter), counter));
                }
                // remove the oldest live
                1 => {
                    if !live.is_empty() {
                        let (id, _) = live.remove(0);
                        arena.remove(id);
                        dead.push(id);
                    }
                }
                // re-alloc after removal
                _ => {
                    if let Some((id, _)) = live.pop() {
                        arena.remove(id);
                        dead.push(id);
                    }
                    counter += 1;
                    live.push((arena.alloc(counter), counter));
                }
            }
            for &(id, value) in &live {
                prop_assert_eq!(arena.get(id), Some(&value));
            }
            for &id in &dead {
                prop_assert_eq!(arena.get(id), None);
            }
            prop_assert_eq!(arena.len(), live.len());
        }
    }
}
