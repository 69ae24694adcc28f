//! Mutation primitives: rename, delete and move, plus body edits that keep references linked.
//!
//! Each primitive holds the program's mutation lock for its whole run and leaves the Reference
//! Index, every back-reference set and every embedded instruction consistent when it returns.
//! Validation happens before anything is touched, so an `Err` means nothing changed.
//!
//! Methods whose instruction streams are edited get their local-variable references and their
//! control flow graph rebuilt before the primitive returns.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::cfg;
use crate::descriptor::{rename_in_descriptor, rename_internal};
use crate::error::MutationError;
use crate::hierarchy;
use crate::index::{field_key, method_key};
use crate::ir::{
    Annotation, Class, ClassId, Constant, Field, FieldId, InsnId, InsnRef, InstructionKind,
    Method, MethodId,
};
use crate::model::collect_local_references;
use crate::program::Program;
use crate::resolve;

/// Renames a class and rewrites every name, descriptor and signature in the program that
/// embeds the old internal name.
pub fn rename_class(program: &Program, id: ClassId, new_name: &str) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let old_name = program
        .class_name(id)
        .ok_or(MutationError::UnknownClass(id))?;
    if old_name == new_name {
        return Ok(());
    }
    if program.find_class(new_name).is_some() {
        return Err(MutationError::NameTaken(new_name.to_string()));
    }
    let rename = ClassRename {
        old: &old_name,
        new: new_name,
    };

    let mut names: HashMap<ClassId, String> = program
        .class_ids()
        .into_iter()
        .filter_map(|class| program.class_name(class).map(|name| (class, name)))
        .collect();
    names.insert(id, new_name.to_string());

    // Method keys embed descriptors; make sure the rewrite cannot fold two methods together.
    let mut method_keys: HashMap<String, MethodId> = HashMap::new();
    for method_id in program.method_ids() {
        let Some((owner, name, descriptor)) = program
            .method(method_id)
            .map(|method| (method.owner, method.name.clone(), method.descriptor.clone()))
        else {
            continue;
        };
        let owner = names.get(&owner).cloned().unwrap_or_default();
        let descriptor = rename.descriptor(&descriptor).unwrap_or(descriptor);
        let key = method_key(&owner, &name, &descriptor);
        if method_keys.insert(key.clone(), method_id).is_some() {
            return Err(MutationError::NameTaken(key));
        }
    }

    hierarchy::unlink_class(program, id);
    let index = program.index();
    index.remove_class(&old_name, id);
    index.register_class(new_name, id);

    for class_id in program.class_ids() {
        program.update_class(class_id, |class| {
            if class.id == id {
                class.name = new_name.to_string();
            }
            rename.class(class);
        });
    }

    for field_id in program.field_ids() {
        let rekey = program
            .update_field(field_id, |field| {
                rename.field(field);
                (field.owner == id).then(|| field.name.clone())
            })
            .flatten();
        if let Some(name) = rekey {
            index.remove_field(&field_key(&old_name, &name), field_id);
            index.register_field(new_name, &name, field_id);
        }
    }

    for method_id in program.method_ids() {
        let rekey = program
            .update_method(method_id, |method| {
                let old_descriptor = method.descriptor.clone();
                rename.method(method);
                let owner = names.get(&method.owner)?;
                let old_owner = if method.owner == id {
                    old_name.as_str()
                } else {
                    owner.as_str()
                };
                let old_key = method_key(old_owner, &method.name, &old_descriptor);
                let new_key = method_key(owner, &method.name, &method.descriptor);
                (old_key != new_key).then(|| {
                    (
                        old_key,
                        owner.clone(),
                        method.name.clone(),
                        method.descriptor.clone(),
                    )
                })
            })
            .flatten();
        if let Some((old_key, owner, name, descriptor)) = rekey {
            index.remove_method(&old_key, method_id);
            index.register_method(&owner, &name, &descriptor, method_id);
        }
    }

    hierarchy::relink_class(program, id);
    debug!(from = %old_name, to = %new_name, "class renamed");
    Ok(())
}

/// Renames a field and every instruction that references it.
pub fn rename_field(program: &Program, id: FieldId, new_name: &str) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (owner, old_name, references) = program
        .field(id)
        .map(|field| (field.owner, field.name.clone(), field.references.clone()))
        .ok_or(MutationError::UnknownField(id))?;
    if old_name == new_name {
        return Ok(());
    }
    let owner_name = program
        .class_name(owner)
        .ok_or(MutationError::UnknownClass(owner))?;
    let new_key = field_key(&owner_name, new_name);
    if program.index().lookup_field(&new_key).is_some() {
        return Err(MutationError::NameTaken(new_key));
    }
    // References reached through the superclass fallback name a subclass; the new name must
    // not bind them to a field that subclass declares.
    for reference in &references {
        let Some(InstructionKind::Field(field)) =
            program.instruction(*reference).map(|insn| insn.kind)
        else {
            continue;
        };
        let key = field_key(&field.owner, new_name);
        if program
            .index()
            .lookup_field(&key)
            .is_some_and(|other| other != id)
        {
            return Err(MutationError::NameTaken(key));
        }
    }
    if rebinds_inherited_reference(program, id, &owner_name, new_name) {
        return Err(MutationError::NameTaken(new_key));
    }

    program
        .index()
        .remove_field(&field_key(&owner_name, &old_name), id);
    program.index().register_field(&owner_name, new_name, id);
    program.update_field(id, |field| field.name = new_name.to_string());

    for reference in &references {
        update_instruction(program, *reference, |kind| {
            if let InstructionKind::Field(field) = kind {
                field.name = new_name.to_string();
            }
        });
    }
    debug!(owner = %owner_name, from = %old_name, to = %new_name, references = references.len(), "field renamed");
    Ok(())
}

/// Renames a method and every invocation of it. Constructors and static initializers keep
/// their names.
pub fn rename_method(
    program: &Program,
    id: MethodId,
    new_name: &str,
) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (owner, old_name, descriptor, invocations, is_constructor) = program
        .method(id)
        .map(|method| {
            (
                method.owner,
                method.name.clone(),
                method.descriptor.clone(),
                method.invocations.clone(),
                method.is_constructor(),
            )
        })
        .ok_or(MutationError::UnknownMethod(id))?;
    if is_constructor {
        return Err(MutationError::Constructor(id));
    }
    if old_name == new_name {
        return Ok(());
    }
    let owner_name = program
        .class_name(owner)
        .ok_or(MutationError::UnknownClass(owner))?;
    let new_key = method_key(&owner_name, new_name, &descriptor);
    if program.index().lookup_method(&new_key).is_some() {
        return Err(MutationError::NameTaken(new_key));
    }

    program
        .index()
        .remove_method(&method_key(&owner_name, &old_name, &descriptor), id);
    program
        .index()
        .register_method(&owner_name, new_name, &descriptor, id);
    program.update_method(id, |method| method.name = new_name.to_string());

    for invocation in &invocations {
        update_instruction(program, *invocation, |kind| {
            if let InstructionKind::Method(call) = kind {
                call.name = new_name.to_string();
            }
        });
    }
    debug!(owner = %owner_name, from = %old_name, to = %new_name, invocations = invocations.len(), "method renamed");
    Ok(())
}

/// Deletes a field. Every instruction that referenced it is removed from its method.
pub fn delete_field(program: &Program, id: FieldId) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (owner, name, references) = program
        .field(id)
        .map(|field| (field.owner, field.name.clone(), field.references.clone()))
        .ok_or(MutationError::UnknownField(id))?;

    let touched = remove_instructions(program, &references);
    program.update_class(owner, |class| class.fields.retain(|field| *field != id));
    if let Some(owner_name) = program.class_name(owner) {
        program.index().remove_field(&field_key(&owner_name, &name), id);
    }
    program.fields.remove(&id);
    refresh_methods(program, &touched);

    debug!(field = %name, removed = references.len(), "field deleted");
    Ok(())
}

/// Deletes a method. Every call to it is removed from its caller, and the method's own
/// references are dropped from the entities they pointed at.
pub fn delete_method(program: &Program, id: MethodId) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (owner, key, invocations, own_references) = {
        let method = program.method(id).ok_or(MutationError::UnknownMethod(id))?;
        let own_references: Vec<_> = method
            .instructions
            .iter()
            .filter(|insn| resolve::is_reference(&insn.kind))
            .map(|insn| (insn.id, insn.kind.clone()))
            .collect();
        (
            method.owner,
            (method.name.clone(), method.descriptor.clone()),
            method.invocations.clone(),
            own_references,
        )
    };

    for (insn, kind) in &own_references {
        resolve::forget_instruction(program, Some(owner), InsnRef::new(id, *insn), kind);
    }
    let callers: BTreeSet<InsnRef> = invocations
        .iter()
        .filter(|invocation| invocation.method != id)
        .copied()
        .collect();
    let mut touched = remove_instructions(program, &callers);
    touched.remove(&id);

    program.update_class(owner, |class| class.methods.retain(|method| *method != id));
    if let Some(owner_name) = program.class_name(owner) {
        program
            .index()
            .remove_method(&method_key(&owner_name, &key.0, &key.1), id);
    }
    program.methods.remove(&id);
    refresh_methods(program, &touched);

    debug!(method = %key.0, removed = callers.len(), "method deleted");
    Ok(())
}

/// Moves a field to `destination`, keeping its id. References are retargeted and re-resolved.
pub fn move_field(
    program: &Program,
    id: FieldId,
    destination: ClassId,
) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (source, name) = program
        .field(id)
        .map(|field| (field.owner, field.name.clone()))
        .ok_or(MutationError::UnknownField(id))?;
    if source == destination {
        return Err(MutationError::SameOwner);
    }
    let destination_name = program
        .class_name(destination)
        .ok_or(MutationError::UnknownClass(destination))?;
    let new_key = field_key(&destination_name, &name);
    if program.index().lookup_field(&new_key).is_some()
        || rebinds_inherited_reference(program, id, &destination_name, &name)
    {
        return Err(MutationError::NameTaken(new_key));
    }

    if let Some(source_name) = program.class_name(source) {
        program
            .index()
            .remove_field(&field_key(&source_name, &name), id);
    }
    program.update_class(source, |class| class.fields.retain(|field| *field != id));
    let Some((_, mut field)) = program.fields.remove(&id) else {
        return Err(MutationError::UnknownField(id));
    };
    let references = std::mem::take(&mut field.references);
    program.attach_field(destination, field)?;

    for reference in &references {
        update_instruction(program, *reference, |kind| {
            if let InstructionKind::Field(field) = kind {
                field.owner = destination_name.clone();
            }
        });
        resolve::resolve_instruction(program, *reference);
    }
    debug!(field = %name, to = %destination_name, "field moved");
    Ok(())
}

/// Moves a method to `destination`, keeping its id. Invocations are retargeted and
/// re-resolved; the method's own references are re-resolved from its new class.
pub fn move_method(
    program: &Program,
    id: MethodId,
    destination: ClassId,
) -> Result<(), MutationError> {
    let _guard = program.lock_mutations();
    let (source, name, descriptor, is_constructor) = program
        .method(id)
        .map(|method| {
            (
                method.owner,
                method.name.clone(),
                method.descriptor.clone(),
                method.is_constructor(),
            )
        })
        .ok_or(MutationError::UnknownMethod(id))?;
    if is_constructor {
        return Err(MutationError::Constructor(id));
    }
    if source == destination {
        return Err(MutationError::SameOwner);
    }
    let (destination_name, destination_is_interface) = program
        .class(destination)
        .map(|class| (class.name.clone(), class.is_interface()))
        .ok_or(MutationError::UnknownClass(destination))?;
    let new_key = method_key(&destination_name, &name, &descriptor);
    if program.index().lookup_method(&new_key).is_some() {
        return Err(MutationError::NameTaken(new_key));
    }

    let own_references: Vec<_> = program
        .method(id)
        .map(|method| {
            method
                .instructions
                .iter()
                .filter(|insn| resolve::is_reference(&insn.kind))
                .map(|insn| (insn.id, insn.kind.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (insn, kind) in &own_references {
        resolve::forget_instruction(program, Some(source), InsnRef::new(id, *insn), kind);
    }

    if let Some(source_name) = program.class_name(source) {
        program
            .index()
            .remove_method(&method_key(&source_name, &name, &descriptor), id);
    }
    program.update_class(source, |class| class.methods.retain(|method| *method != id));
    let Some((_, mut method)) = program.methods.remove(&id) else {
        return Err(MutationError::UnknownMethod(id));
    };
    let invocations = std::mem::take(&mut method.invocations);
    program.attach_method(destination, method)?;

    for invocation in &invocations {
        update_instruction(program, *invocation, |kind| {
            if let InstructionKind::Method(call) = kind {
                call.owner = destination_name.clone();
                call.is_interface = destination_is_interface;
            }
        });
        resolve::resolve_instruction(program, *invocation);
    }
    resolve::resolve_method(program, id);
    debug!(method = %name, to = %destination_name, "method moved");
    Ok(())
}

/// Removes instructions from one method body, unlinking any that were resolved references.
/// Ids that are not in the body are skipped. Returns how many instructions were removed.
pub fn delete_instructions(
    program: &Program,
    method: MethodId,
    ids: &[InsnId],
) -> Result<usize, MutationError> {
    let _guard = program.lock_mutations();
    let owner = program
        .method(method)
        .map(|body| body.owner)
        .ok_or(MutationError::UnknownMethod(method))?;

    let removed: Vec<_> = program
        .update_method(method, |body| {
            ids.iter()
                .filter_map(|id| body.instructions.remove(*id))
                .collect()
        })
        .unwrap_or_default();
    for insn in &removed {
        if resolve::is_reference(&insn.kind) {
            resolve::forget_instruction(
                program,
                Some(owner),
                InsnRef::new(method, insn.id),
                &insn.kind,
            );
        }
    }
    refresh_methods(program, &BTreeSet::from([method]));

    debug!(?method, removed = removed.len(), "instructions deleted");
    Ok(removed.len())
}

/// Edits a method body in place and rebuilds its local-variable references and control flow.
///
/// `edit` must not add or remove field, method or type references; use
/// [`delete_instructions`] for those.
pub fn edit_method_body<R>(
    program: &Program,
    method: MethodId,
    edit: impl FnOnce(&mut Method) -> R,
) -> Result<R, MutationError> {
    let _guard = program.lock_mutations();
    let result = program
        .update_method(method, edit)
        .ok_or(MutationError::UnknownMethod(method))?;
    refresh_methods(program, &BTreeSet::from([method]));
    Ok(result)
}

/// Applies `update` to one instruction in place.
fn update_instruction(program: &Program, at: InsnRef, update: impl FnOnce(&mut InstructionKind)) {
    program.update_method(at.method, |method| {
        if let Some(insn) = method.instructions.get_mut(at.insn) {
            update(&mut insn.kind);
        }
    });
}

/// Removes each referenced instruction from its method. Returns the methods that changed.
fn remove_instructions(program: &Program, references: &BTreeSet<InsnRef>) -> BTreeSet<MethodId> {
    let mut touched = BTreeSet::new();
    for reference in references {
        let removed = program
            .update_method(reference.method, |method| {
                method.instructions.remove(reference.insn).is_some()
            })
            .unwrap_or(false);
        if removed {
            touched.insert(reference.method);
        }
    }
    touched
}

/// Whether an instruction naming `owner.name` currently resolves, through the superclass
/// fallback, to a field other than `id`. Indexing `id` under that key would steal it.
fn rebinds_inherited_reference(program: &Program, id: FieldId, owner: &str, name: &str) -> bool {
    program
        .field_ids()
        .into_iter()
        .filter(|other| *other != id)
        .any(|other| {
            let references: Vec<InsnRef> = program
                .field(other)
                .filter(|field| field.name == name)
                .map(|field| field.references.iter().copied().collect())
                .unwrap_or_default();
            references.into_iter().any(|reference| {
                matches!(
                    program.instruction(reference).map(|insn| insn.kind),
                    Some(InstructionKind::Field(field)) if field.owner == owner && field.name == name
                )
            })
        })
}

fn refresh_methods(program: &Program, methods: &BTreeSet<MethodId>) {
    for id in methods {
        program.update_method(*id, |method| {
            let Method {
                instructions,
                local_variables,
                ..
            } = method;
            collect_local_references(instructions, local_variables);
        });
        cfg::rebuild_cfg(program, *id);
    }
}

/// Rewrites of one class rename, applied entity by entity.
struct ClassRename<'a> {
    old: &'a str,
    new: &'a str,
}

impl ClassRename<'_> {
    fn descriptor(&self, text: &str) -> Option<String> {
        rename_in_descriptor(text, self.old, self.new)
    }

    fn rewrite_descriptor(&self, slot: &mut String) {
        if let Some(renamed) = self.descriptor(slot) {
            *slot = renamed;
        }
    }

    fn rewrite_signature(&self, slot: &mut Option<String>) {
        if let Some(signature) = slot {
            self.rewrite_descriptor(signature);
        }
    }

    fn rewrite_internal(&self, slot: &mut String) {
        if let Some(renamed) = rename_internal(slot, self.old, self.new) {
            *slot = renamed;
        }
    }

    fn annotations(&self, annotations: &mut [Annotation]) {
        for annotation in annotations {
            self.rewrite_descriptor(&mut annotation.descriptor);
        }
    }

    fn class(&self, class: &mut Class) {
        if let Some(super_name) = &mut class.super_name {
            self.rewrite_internal(super_name);
        }
        for interface in &mut class.interfaces {
            self.rewrite_internal(interface);
        }
        self.rewrite_signature(&mut class.signature);
        self.annotations(&mut class.annotations);
        for bootstrap in &mut class.bootstrap_methods {
            self.constant(&mut bootstrap.handle);
            for argument in &mut bootstrap.arguments {
                self.constant(argument);
            }
        }
    }

    fn field(&self, field: &mut Field) {
        self.rewrite_descriptor(&mut field.descriptor);
        self.rewrite_signature(&mut field.signature);
        if let Some(value) = &mut field.value {
            self.constant(value);
        }
        self.annotations(&mut field.annotations);
    }

    fn method(&self, method: &mut Method) {
        self.rewrite_descriptor(&mut method.descriptor);
        self.rewrite_signature(&mut method.signature);
        for exception in &mut method.exceptions {
            self.rewrite_internal(exception);
        }
        for try_catch in &mut method.try_catch {
            if let Some(catch_type) = &mut try_catch.catch_type {
                self.rewrite_internal(catch_type);
            }
        }
        for variable in &mut method.local_variables {
            self.rewrite_descriptor(&mut variable.descriptor);
            self.rewrite_signature(&mut variable.signature);
        }
        for insn in method.instructions.iter_mut() {
            self.instruction(&mut insn.kind);
        }
        self.annotations(&mut method.annotations);
    }

    fn instruction(&self, kind: &mut InstructionKind) {
        match kind {
            InstructionKind::Field(field) => {
                self.rewrite_internal(&mut field.owner);
                self.rewrite_descriptor(&mut field.descriptor);
            }
            InstructionKind::Method(call) => {
                self.rewrite_internal(&mut call.owner);
                self.rewrite_descriptor(&mut call.descriptor);
            }
            InstructionKind::InvokeDynamic(dynamic) => {
                self.rewrite_descriptor(&mut dynamic.descriptor)
            }
            InstructionKind::Type(class) => self.rewrite_internal(class),
            InstructionKind::MultiANewArray { class, .. } => self.rewrite_internal(class),
            InstructionKind::Constant(constant) => self.constant(constant),
            _ => {}
        }
    }

    fn constant(&self, constant: &mut Constant) {
        match constant {
            Constant::Class(class) => self.rewrite_internal(class),
            Constant::MethodType(descriptor) => self.rewrite_descriptor(descriptor),
            Constant::MethodHandle {
                owner, descriptor, ..
            } => {
                self.rewrite_internal(owner);
                self.rewrite_descriptor(descriptor);
            }
            Constant::Dynamic { descriptor, .. } => self.rewrite_descriptor(descriptor),
            _ => {}
        }
    }
}
