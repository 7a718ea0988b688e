//! Reverse pointer index: target address → referring pointer addresses.
//!
//! Grouped by target box so that a delete finds every referrer of any field
//! of the box in O(incoming pointers).

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::model::{Address, BoxId};

#[derive(Debug, Clone, Default)]
pub struct PointerIndex {
    by_box: HashMap<BoxId, BTreeMap<Address, BTreeSet<Address>>>,
    len: usize,
}

impl PointerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pointer: &Address, target: &Address) {
        let inserted = self
            .by_box
            .entry(target.box_id)
            .or_default()
            .entry(target.clone())
            .or_default()
            .insert(pointer.clone());
        if inserted {
            self.len += 1;
        }
    }

    pub fn remove(&mut self, pointer: &Address, target: &Address) -> bool {
        let Some(targets) = self.by_box.get_mut(&target.box_id) else {
            return false;
        };
        let Some(pointers) = targets.get_mut(target) else {
            return false;
        };
        let removed = pointers.remove(pointer);
        if pointers.is_empty() {
            targets.remove(target);
        }
        if targets.is_empty() {
            self.by_box.remove(&target.box_id);
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn contains(&self, pointer: &Address, target: &Address) -> bool {
        self.by_box
            .get(&target.box_id)
            .and_then(|targets| targets.get(target))
            .is_some_and(|pointers| pointers.contains(pointer))
    }

    /// Pointers targeting exactly `target`.
    pub fn incoming(&self, target: &Address) -> impl Iterator<Item = &Address> {
        self.by_box
            .get(&target.box_id)
            .and_then(|targets| targets.get(target))
            .into_iter()
            .flatten()
    }

    /// Every `(pointer, target)` pair whose target lies in box `id`,
    /// ordered by target then pointer.
    pub fn incoming_to_box(&self, id: BoxId) -> Vec<(Address, Address)> {
        self.by_box
            .get(&id)
            .map(|targets| {
                targets
                    .iter()
                    .flat_map(|(target, pointers)| {
                        pointers.iter().map(move |p| (p.clone(), target.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every indexed `(pointer, target)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Address)> {
        self.by_box.values().flat_map(|targets| {
            targets
                .iter()
                .flat_map(|(target, pointers)| pointers.iter().map(move |p| (p, target)))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let a = BoxId::new();
        let b = BoxId::new();
        let mut index = PointerIndex::new();
        let pointer = Address::field(a, &[1]);
        let target = Address::field(b, &[3]);

        index.insert(&pointer, &target);
        index.insert(&pointer, &target);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&pointer, &target));
        assert_eq!(index.incoming(&target).collect::<Vec<_>>(), vec![&pointer]);
        assert_eq!(index.incoming_to_box(b), vec![(pointer.clone(), target.clone())]);
        assert!(index.incoming_to_box(a).is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_groups() {
        let a = BoxId::new();
        let b = BoxId::new();
        let mut index = PointerIndex::new();
        let p1 = Address::field(a, &[1]);
        let p2 = Address::field(a, &[2]);
        let target = Address::of_box(b);

        index.insert(&p1, &target);
        index.insert(&p2, &target);
        assert!(index.remove(&p1, &target));
        assert!(!index.remove(&p1, &target));
        assert_eq!(index.len(), 1);
        assert!(index.remove(&p2, &target));
        assert!(index.is_empty());
        assert_eq!(index.incoming(&target).count(), 0);
    }
}
