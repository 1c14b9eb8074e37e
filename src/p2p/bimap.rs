//! Bidirectional map
//!
//! Both directions are updated by the same call, so a left key and a right
//! key are always paired one-to-one.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct BiMap<L, R> {
    left: HashMap<L, R>,
    right: HashMap<R, L>,
}

impl<L, R> Default for BiMap<L, R> {
    fn default() -> Self {
        Self {
            left: HashMap::new(),
            right: HashMap::new(),
        }
    }
}

impl<L, R> BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `l` with `r`, dropping any pairing either side had before
    pub fn insert(&mut self, l: L, r: R) {
        self.remove_by_left(&l);
        self.remove_by_right(&r);
        self.left.insert(l.clone(), r.clone());
        self.right.insert(r, l);
    }

    pub fn get_by_left(&self, l: &L) -> Option<&R> {
        self.left.get(l)
    }

    pub fn get_by_right(&self, r: &R) -> Option<&L> {
        self.right.get(r)
    }

    pub fn contains_left(&self, l: &L) -> bool {
        self.left.contains_key(l)
    }

    pub fn contains_right(&self, r: &R) -> bool {
        self.right.contains_key(r)
    }

    pub fn remove_by_left(&mut self, l: &L) -> Option<R> {
        let r = self.left.remove(l)?;
        self.right.remove(&r);
        Some(r)
    }

    pub fn remove_by_right(&mut self, r: &R) -> Option<L> {
        let l = self.right.remove(r)?;
        self.left.remove(&l);
        Some(l)
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L, &R)> {
        self.left.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_both_ways() {
        let mut map = BiMap::new();
        map.insert("alpha".to_string(), 1u32);

        assert_eq!(map.get_by_left(&"alpha".to_string()), Some(&1));
        assert_eq!(map.get_by_right(&1), Some(&"alpha".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_reinsert_unpairs_old_entries() {
        let mut map = BiMap::new();
        map.insert("a", 1u32);
        map.insert("b", 2u32);

        // "a" takes 2: the old a->1 and b->2 pairings both go away
        map.insert("a", 2);

        assert_eq!(map.get_by_left(&"a"), Some(&2));
        assert_eq!(map.get_by_right(&2), Some(&"a"));
        assert!(!map.contains_left(&"b"));
        assert!(!map.contains_right(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_keeps_sides_in_sync() {
        let mut map = BiMap::new();
        map.insert(10u32, 'x');
        map.insert(11u32, 'y');

        assert_eq!(map.remove_by_right(&'x'), Some(10));
        assert!(!map.contains_left(&10));
        assert_eq!(map.remove_by_left(&11), Some('y'));
        assert!(map.is_empty());
        assert_eq!(map.remove_by_left(&11), None);
    }
}
