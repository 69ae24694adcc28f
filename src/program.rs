//! The program context: entity arenas plus the Reference Index.
//!
//! A [`Program`] is an explicitly passed handle; nothing in the crate reaches for a global.
//! Entities live in concurrent arenas keyed by ids that are never reused, so holding an id is
//! always safe: once the entity is deleted the id simply stops resolving.
//!
//! Accessors hand out short-lived map guards. Never hold one across another call on the same
//! program; copy what you need out of it first.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use parking_lot::{Mutex, MutexGuard};

use crate::index::{ReferenceIndex, field_key, method_key};
use crate::ir::{
    Annotation, AnnotationValue, Class, ClassId, Field, FieldId, InsnId, InsnRef, Instruction,
    InstructionKind, LabelId, Method, MethodId,
};
use crate::opcodes;
use crate::resolve::{self, Target};
use crate::settings::Settings;

/// Every loaded class, field and method, and the index that names them.
#[derive(Debug)]
pub struct Program {
    index: ReferenceIndex,
    pub(crate) classes: DashMap<ClassId, Class>,
    pub(crate) fields: DashMap<FieldId, Field>,
    pub(crate) methods: DashMap<MethodId, Method>,
    next_id: AtomicU32,
    mutation: Mutex<()>,
    settings: Settings,
}

impl Default for Program {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Program {
    pub fn new(settings: Settings) -> Self {
        Self {
            index: ReferenceIndex::new(),
            classes: DashMap::new(),
            fields: DashMap::new(),
            methods: DashMap::new(),
            next_id: AtomicU32::new(1),
            mutation: Mutex::new(()),
            settings,
        }
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn next(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_class_id(&self) -> ClassId {
        ClassId(self.next())
    }

    pub(crate) fn next_field_id(&self) -> FieldId {
        FieldId(self.next())
    }

    pub(crate) fn next_method_id(&self) -> MethodId {
        MethodId(self.next())
    }

    /// Serializes mutation primitives against each other.
    pub(crate) fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock()
    }

    /// Allocates an instruction with a fresh program-wide id.
    pub fn new_instruction(&self, opcode: u8, kind: InstructionKind) -> Instruction {
        Instruction {
            id: InsnId(self.next()),
            opcode,
            kind,
        }
    }

    /// Allocates a label and the pseudo-instruction that marks its position.
    pub fn new_label(&self) -> (LabelId, Instruction) {
        let label = LabelId(self.next());
        let instruction = self.new_instruction(opcodes::LABEL, InstructionKind::Label(label));
        (label, instruction)
    }

    pub fn class(&self, id: ClassId) -> Option<Ref<'_, ClassId, Class>> {
        self.classes.get(&id)
    }

    pub fn field(&self, id: FieldId) -> Option<Ref<'_, FieldId, Field>> {
        self.fields.get(&id)
    }

    pub fn method(&self, id: MethodId) -> Option<Ref<'_, MethodId, Method>> {
        self.methods.get(&id)
    }

    /// Runs `update` on the class. Renames must go through the mutation primitives instead.
    pub fn update_class<R>(&self, id: ClassId, update: impl FnOnce(&mut Class) -> R) -> Option<R> {
        self.classes.get_mut(&id).map(|mut class| update(&mut class))
    }

    pub fn update_field<R>(&self, id: FieldId, update: impl FnOnce(&mut Field) -> R) -> Option<R> {
        self.fields.get_mut(&id).map(|mut field| update(&mut field))
    }

    pub fn update_method<R>(
        &self,
        id: MethodId,
        update: impl FnOnce(&mut Method) -> R,
    ) -> Option<R> {
        self.methods.get_mut(&id).map(|mut method| update(&mut method))
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.index.lookup_class(name)
    }

    pub fn find_field(&self, owner: &str, name: &str) -> Option<FieldId> {
        self.index.lookup_field(&field_key(owner, name))
    }

    pub fn find_method(&self, owner: &str, name: &str, descriptor: &str) -> Option<MethodId> {
        self.index
            .lookup_method(&method_key(owner, name, descriptor))
    }

    /// First method named `name` in any class. Linear in the number of methods.
    pub fn find_method_by_name(&self, name: &str) -> Option<MethodId> {
        let mut ids = self.index.method_ids();
        ids.sort();
        ids.into_iter()
            .find(|id| self.method(*id).is_some_and(|method| method.name == name))
    }

    /// First field named `name` in any class. Linear in the number of fields.
    pub fn find_field_by_name(&self, name: &str) -> Option<FieldId> {
        let mut ids = self.index.field_ids();
        ids.sort();
        ids.into_iter()
            .find(|id| self.field(*id).is_some_and(|field| field.name == name))
    }

    /// Method named `name` declared by `class`.
    pub fn method_by_name(&self, class: ClassId, name: &str) -> Option<MethodId> {
        let methods = self.class(class)?.methods.clone();
        methods
            .into_iter()
            .find(|id| self.method(*id).is_some_and(|method| method.name == name))
    }

    pub fn field_by_name(&self, class: ClassId, name: &str) -> Option<FieldId> {
        let fields = self.class(class)?.fields.clone();
        fields
            .into_iter()
            .find(|id| self.field(*id).is_some_and(|field| field.name == name))
    }

    pub fn class_name(&self, id: ClassId) -> Option<String> {
        self.class(id).map(|class| class.name.clone())
    }

    /// The scanned superclass of `id`, or `None` when it was never loaded.
    pub fn super_class(&self, id: ClassId) -> Option<ClassId> {
        let super_name = self.class(id)?.super_name.clone()?;
        self.find_class(&super_name)
    }

    /// Live class ids in load order.
    pub fn class_ids(&self) -> Vec<ClassId> {
        let mut ids: Vec<ClassId> = self.classes.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn field_ids(&self) -> Vec<FieldId> {
        let mut ids: Vec<FieldId> = self.fields.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn method_ids(&self) -> Vec<MethodId> {
        let mut ids: Vec<MethodId> = self.methods.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// `owner.name.descriptor` of a method, the shape used by the index.
    pub fn method_qualified_name(&self, id: MethodId) -> Option<String> {
        let (owner, name, descriptor) = {
            let method = self.method(id)?;
            (method.owner, method.name.clone(), method.descriptor.clone())
        };
        let owner = self.class_name(owner)?;
        Some(method_key(&owner, &name, &descriptor))
    }

    pub fn field_qualified_name(&self, id: FieldId) -> Option<String> {
        let (owner, name) = {
            let field = self.field(id)?;
            (field.owner, field.name.clone())
        };
        let owner = self.class_name(owner)?;
        Some(field_key(&owner, &name))
    }

    /// Copy of one instruction of a method.
    pub fn instruction(&self, at: InsnRef) -> Option<Instruction> {
        self.method(at.method)?.instructions.get(at.insn).cloned()
    }

    pub fn annotate_class(&self, id: ClassId, name: &str, values: Vec<(String, AnnotationValue)>) {
        self.update_class(id, |class| class.annotations.push(Annotation::named(name, values)));
    }

    pub fn annotate_field(&self, id: FieldId, name: &str, values: Vec<(String, AnnotationValue)>) {
        self.update_field(id, |field| field.annotations.push(Annotation::named(name, values)));
    }

    pub fn annotate_method(
        &self,
        id: MethodId,
        name: &str,
        values: Vec<(String, AnnotationValue)>,
    ) {
        self.update_method(id, |method| {
            method.annotations.push(Annotation::named(name, values))
        });
    }

    /// Drops every entity and index entry.
    pub fn clear(&self) {
        let _guard = self.lock_mutations();
        self.index.clear();
        self.classes.clear();
        self.fields.clear();
        self.methods.clear();
    }

    /// Checks the index and back-reference invariants, returning one message per violation.
    ///
    /// Every live entity must be reachable under exactly its current key, and every
    /// back-reference must point at an instruction that still exists and re-resolves to the
    /// entity holding it.
    pub fn consistency_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for id in self.class_ids() {
            let Some(name) = self.class_name(id) else {
                continue;
            };
            let keys = self.index.class_keys_of(id);
            if keys != vec![name.clone()] {
                problems.push(format!("class {name} is indexed under {keys:?}"));
            }
            let references: Vec<InsnRef> = self
                .class(id)
                .map(|class| class.type_references.iter().copied().collect())
                .unwrap_or_default();
            for reference in references {
                if !self.resolves_to(reference, Target::Class(id)) {
                    problems.push(format!("class {name} has stale type reference {reference:?}"));
                }
            }
        }

        for id in self.field_ids() {
            let Some(key) = self.field_qualified_name(id) else {
                problems.push(format!("field {id:?} has no live owner"));
                continue;
            };
            let keys = self.index.field_keys_of(id);
            if keys != vec![key.clone()] {
                problems.push(format!("field {key} is indexed under {keys:?}"));
            }
            let references: Vec<InsnRef> = self
                .field(id)
                .map(|field| field.references.iter().copied().collect())
                .unwrap_or_default();
            for reference in references {
                if !self.resolves_to(reference, Target::Field(id)) {
                    problems.push(format!("field {key} has stale reference {reference:?}"));
                }
            }
        }

        for id in self.method_ids() {
            let Some(key) = self.method_qualified_name(id) else {
                problems.push(format!("method {id:?} has no live owner"));
                continue;
            };
            let keys = self.index.method_keys_of(id);
            if keys != vec![key.clone()] {
                problems.push(format!("method {key} is indexed under {keys:?}"));
            }
            let references: Vec<InsnRef> = self
                .method(id)
                .map(|method| method.invocations.iter().copied().collect())
                .unwrap_or_default();
            for reference in references {
                if !self.resolves_to(reference, Target::Method(id)) {
                    problems.push(format!("method {key} has stale invocation {reference:?}"));
                }
            }
        }

        problems
    }

    /// Whether the instruction at `at` still exists and resolves to `target` by its names.
    fn resolves_to(&self, at: InsnRef, target: Target) -> bool {
        let Some((context, kind)) = self.method(at.method).and_then(|method| {
            let kind = method.instructions.get(at.insn)?.kind.clone();
            Some((method.owner, kind))
        }) else {
            return false;
        };
        resolve::lookup_target(self, Some(context), &kind) == Some(target)
    }
}
