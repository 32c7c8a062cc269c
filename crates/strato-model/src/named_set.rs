use std::collections::HashSet;
use std::ops::Sub;

use indexmap::IndexMap;

/// Anything that can live in a [`NamedSet`].
pub trait Named {
    fn name(&self) -> &str;
}

/// An insertion-ordered mapping from name to item with a set-like API.
///
/// Distinct from a true set in two ways that the diff engine relies on:
/// equality considers names only, and subtraction keeps left-hand entries
/// whose name is absent from the right operand (values come from the left).
#[derive(Debug, Clone)]
pub struct NamedSet<T> {
    items: IndexMap<String, T>,
}

impl<T: Named> NamedSet<T> {
    pub fn new() -> Self {
        Self { items: IndexMap::new() }
    }

    /// Insert an item under its own name. Adding a name twice overwrites.
    pub fn add(&mut self, item: T) {
        self.items.insert(item.name().to_string(), item);
    }

    /// Remove the entry registered under the given item's name.
    pub fn remove(&mut self, item: &T) -> Option<T> {
        self.remove_by_name(item.name())
    }

    pub fn remove_by_name(&mut self, name: &str) -> Option<T> {
        self.items.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.items.get(name)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }
}

impl<T: Named + PartialEq> NamedSet<T> {
    /// Membership test by value: the entry under the item's name must equal it.
    pub fn contains(&self, item: &T) -> bool {
        self.items.get(item.name()) == Some(item)
    }
}

impl<T: Named> Default for NamedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Named> FromIterator<T> for NamedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.add(item);
        }
        set
    }
}

impl<'a, T> IntoIterator for &'a NamedSet<T> {
    type Item = &'a T;
    type IntoIter = indexmap::map::Values<'a, String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.values()
    }
}

/// Name-based equality: two sets are equal iff they hold the same names.
impl<T> PartialEq for NamedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self.items.keys().all(|k| other.items.contains_key(k))
    }
}

impl<T> Eq for NamedSet<T> {}

/// Equality against a plain value set compares the stored values.
impl<T: Eq + std::hash::Hash> PartialEq<HashSet<T>> for NamedSet<T> {
    fn eq(&self, other: &HashSet<T>) -> bool {
        self.items.len() == other.len() && self.items.values().all(|v| other.contains(v))
    }
}

/// Keep left-hand entries whose name does not appear on the right.
impl<T: Named + Clone> Sub for &NamedSet<T> {
    type Output = NamedSet<T>;

    fn sub(self, rhs: &NamedSet<T>) -> NamedSet<T> {
        let mut out = NamedSet::new();
        for (name, item) in &self.items {
            if !rhs.items.contains_key(name) {
                out.add(item.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Item(String);

    impl Item {
        fn new(name: &str) -> Self {
            Item(name.to_string())
        }
    }

    impl Named for Item {
        fn name(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn new_is_empty() {
        let s: NamedSet<Item> = NamedSet::new();
        assert!(s.is_empty());
        assert_eq!(s.iter().count(), 0);
    }

    #[test]
    fn add_then_contains() {
        let mut s = NamedSet::new();
        let item = Item::new("thename");
        s.add(item.clone());
        assert!(s.contains(&item));
    }

    #[test]
    fn add_same_name_overwrites() {
        #[derive(Debug, Clone, PartialEq)]
        struct Pair(&'static str, u32);
        impl Named for Pair {
            fn name(&self) -> &str {
                self.0
            }
        }

        let mut s = NamedSet::new();
        s.add(Pair("a", 1));
        s.add(Pair("a", 2));
        assert_eq!(s.len(), 1);
        assert_eq!(s.get("a"), Some(&Pair("a", 2)));
    }

    #[test]
    fn remove_by_name() {
        let mut s = NamedSet::new();
        let item = Item::new("thename");
        s.add(item.clone());
        s.remove_by_name("thename");
        assert!(!s.contains(&item));
    }

    #[test]
    fn remove_by_item() {
        let mut s = NamedSet::new();
        let item = Item::new("thename");
        s.add(item.clone());
        s.remove(&item);
        assert!(!s.contains(&item));
    }

    #[test]
    fn subtract_keeps_left_only_names() {
        let mut s1 = NamedSet::new();
        let mut s2 = NamedSet::new();
        let item1 = Item::new("thename1");
        let item2 = Item::new("thename2");
        let item3 = Item::new("thename3");

        s1.add(item1.clone());
        s2.add(item1.clone());
        s1.add(item2.clone());
        s2.add(item3.clone());

        let diff = &s1 - &s2;

        // operands are untouched
        assert!(s1.contains(&item1));
        assert!(s1.contains(&item2));
        assert!(s2.contains(&item1));
        assert!(s2.contains(&item3));

        assert!(!diff.contains(&item1));
        assert!(diff.contains(&item2));
        assert!(!diff.contains(&item3));
    }

    #[test]
    fn subtract_chain() {
        let a = Item::new("a");
        let b = Item::new("b");
        let c = Item::new("c");

        let full: NamedSet<Item> = [a.clone(), b.clone(), c.clone()].into_iter().collect();
        let only_b: NamedSet<Item> = [b].into_iter().collect();
        let only_c: NamedSet<Item> = [c].into_iter().collect();
        let only_a: NamedSet<Item> = [a].into_iter().collect();

        assert_eq!(&(&full - &only_b) - &only_c, only_a);
    }

    #[test]
    fn eq_by_names() {
        let mut s1 = NamedSet::new();
        let mut s2 = NamedSet::new();
        s1.add(Item::new("thename1"));
        s1.add(Item::new("thename2"));
        s2.add(Item::new("thename2"));
        s2.add(Item::new("thename1"));
        assert_eq!(s1, s2);
    }

    #[test]
    fn not_eq_by_names() {
        let mut s1 = NamedSet::new();
        let mut s2 = NamedSet::new();
        s1.add(Item::new("thename1"));
        s2.add(Item::new("thename2"));
        assert_ne!(s1, s2);
    }

    #[test]
    fn eq_against_value_set() {
        let mut s = NamedSet::new();
        s.add(Item::new("a"));
        s.add(Item::new("b"));
        let values: HashSet<Item> = [Item::new("a"), Item::new("b")].into_iter().collect();
        assert_eq!(s, values);
    }

    #[test]
    fn iterates_in_insertion_order() {
        let mut s = NamedSet::new();
        s.add(Item::new("z"));
        s.add(Item::new("a"));
        s.add(Item::new("m"));
        let names: Vec<&str> = s.names().collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }
}
