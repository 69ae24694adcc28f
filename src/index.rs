//! Name-keyed lookup tables from qualified names to live entity ids.
//!
//! Keys use the same shapes the class file uses when it refers to a member:
//!
//! - classes: the internal name, `pkg/Outer$Inner`
//! - fields: `owner.name`
//! - methods: `owner.name.descriptor`
//!
//! All three maps accept concurrent inserts, removals and iteration. Iterating while another
//! thread mutates is safe; the iterator may or may not observe the in-flight change.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::ir::{ClassId, FieldId, MethodId};

pub fn field_key(owner: &str, name: &str) -> String {
    format!("{owner}.{name}")
}

pub fn method_key(owner: &str, name: &str, descriptor: &str) -> String {
    format!("{owner}.{name}.{descriptor}")
}

/// The Reference Index: qualified names to class, field and method ids.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    classes: DashMap<String, ClassId>,
    fields: DashMap<String, FieldId>,
    methods: DashMap<String, MethodId>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the class entry for `name`.
    pub fn register_class(&self, name: &str, id: ClassId) -> Option<ClassId> {
        self.classes.insert(name.to_string(), id)
    }

    /// Indexes `id` under `name` only if the name is free. The check and the insert are one step,
    /// so of two concurrent claims exactly one wins.
    pub fn claim_class(&self, name: &str, id: ClassId) -> bool {
        match self.classes.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(id);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn register_field(&self, owner: &str, name: &str, id: FieldId) -> Option<FieldId> {
        self.fields.insert(field_key(owner, name), id)
    }

    pub fn register_method(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        id: MethodId,
    ) -> Option<MethodId> {
        self.methods
            .insert(method_key(owner, name, descriptor), id)
    }

    pub fn lookup_class(&self, name: &str) -> Option<ClassId> {
        self.classes.get(name).map(|entry| *entry)
    }

    /// Looks up `owner.name`.
    pub fn lookup_field(&self, key: &str) -> Option<FieldId> {
        self.fields.get(key).map(|entry| *entry)
    }

    /// Looks up `owner.name.descriptor`.
    pub fn lookup_method(&self, key: &str) -> Option<MethodId> {
        self.methods.get(key).map(|entry| *entry)
    }

    /// Removes the class entry only if it still points at `id`.
    pub fn remove_class(&self, name: &str, id: ClassId) -> bool {
        self.classes.remove_if(name, |_, current| *current == id).is_some()
    }

    pub fn remove_field(&self, key: &str, id: FieldId) -> bool {
        self.fields.remove_if(key, |_, current| *current == id).is_some()
    }

    pub fn remove_method(&self, key: &str, id: MethodId) -> bool {
        self.methods.remove_if(key, |_, current| *current == id).is_some()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn class_ids(&self) -> Vec<ClassId> {
        self.classes.iter().map(|entry| *entry.value()).collect()
    }

    pub fn field_ids(&self) -> Vec<FieldId> {
        self.fields.iter().map(|entry| *entry.value()).collect()
    }

    pub fn method_ids(&self) -> Vec<MethodId> {
        self.methods.iter().map(|entry| *entry.value()).collect()
    }

    /// Every key currently pointing at `id`. Used to check that no stale key survives a mutation.
    pub fn class_keys_of(&self, id: ClassId) -> Vec<String> {
        self.classes
            .iter()
            .filter(|entry| *entry.value() == id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn field_keys_of(&self, id: FieldId) -> Vec<String> {
        self.fields
            .iter()
            .filter(|entry| *entry.value() == id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn method_keys_of(&self, id: MethodId) -> Vec<String> {
        self.methods
            .iter()
            .filter(|entry| *entry.value() == id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.classes.clear();
        self.fields.clear();
        self.methods.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_and_replace() {
        let index = ReferenceIndex::new();
        assert_eq!(index.register_class("a/Foo", ClassId(1)), None);
        assert_eq!(index.lookup_class("a/Foo"), Some(ClassId(1)));
        assert_eq!(index.register_class("a/Foo", ClassId(2)), Some(ClassId(1)));
        assert_eq!(index.lookup_class("a/Foo"), Some(ClassId(2)));
        assert_eq!(index.lookup_class("a/Missing"), None);

        index.register_field("a/Foo", "x", FieldId(3));
        assert_eq!(index.lookup_field("a/Foo.x"), Some(FieldId(3)));
        index.register_method("a/Foo", "run", "()V", MethodId(4));
        assert_eq!(index.lookup_method("a/Foo.run.()V"), Some(MethodId(4)));
        assert_eq!(index.lookup_method("a/Foo.run.(I)V"), None);
    }

    #[test]
    fn only_one_concurrent_claim_wins() {
        let index = ReferenceIndex::new();
        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (1..=8u32)
                .map(|n| {
                    let index = &index;
                    scope.spawn(move || index.claim_class("dup/X", ClassId(n)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| usize::from(handle.join().expect("join")))
                .sum()
        });
        assert_eq!(wins, 1);
        assert_eq!(index.class_count(), 1);
        assert!(!index.claim_class("dup/X", ClassId(9)));
    }

    #[test]
    fn removal_is_guarded_by_identity() {
        let index = ReferenceIndex::new();
        index.register_field("Foo", "x", FieldId(1));
        assert!(!index.remove_field("Foo.x", FieldId(2)));
        assert_eq!(index.lookup_field("Foo.x"), Some(FieldId(1)));
        assert!(index.remove_field("Foo.x", FieldId(1)));
        assert_eq!(index.lookup_field("Foo.x"), None);
    }

    #[test]
    fn concurrent_inserts_all_land() {
        let index = ReferenceIndex::new();
        std::thread::scope(|scope| {
            for worker in 0..4u32 {
                let index = &index;
                scope.spawn(move || {
                    for n in 0..250u32 {
                        let id = worker * 1000 + n;
                        index.register_method("Owner", &format!("m{id}"), "()V", MethodId(id));
                    }
                });
            }
        });
        assert_eq!(index.method_count(), 1000);
        assert_eq!(index.method_keys_of(MethodId(3249)), vec!["Owner.m3249.()V"]);
    }
}
