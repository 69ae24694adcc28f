//! Reference Resolver: binds field, method and type instructions to the entities they name.
//!
//! A resolved instruction is recorded in the target's back-reference set. Instructions that
//! name something outside the scanned classes stay plain instructions.

use rayon::prelude::*;

use crate::descriptor;
use crate::index::{field_key, method_key};
use crate::ir::{ClassId, FieldId, InsnRef, InstructionKind, MethodId};
use crate::program::Program;

/// Entity an instruction resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Field(FieldId),
    Method(MethodId),
    Class(ClassId),
}

/// Looks up what `kind` refers to.
///
/// Field references that miss on their recorded owner are retried once against the superclass
/// of `context`, the class holding the instruction.
pub fn lookup_target(
    program: &Program,
    context: Option<ClassId>,
    kind: &InstructionKind,
) -> Option<Target> {
    match kind {
        InstructionKind::Field(field) => {
            if let Some(id) = program.index().lookup_field(&field.key()) {
                return Some(Target::Field(id));
            }
            let super_name = program.class(context?)?.super_name.clone()?;
            program
                .index()
                .lookup_field(&field_key(&super_name, &field.name))
                .map(Target::Field)
        }
        InstructionKind::Method(call) => program
            .index()
            .lookup_method(&method_key(&call.owner, &call.name, &call.descriptor))
            .map(Target::Method),
        _ => {
            let class = descriptor::class_of(referenced_class(kind)?)?;
            program.find_class(class).map(Target::Class)
        }
    }
}

fn referenced_class(kind: &InstructionKind) -> Option<&str> {
    match kind {
        InstructionKind::Type(class) => Some(class),
        InstructionKind::MultiANewArray { class, .. } => Some(class),
        InstructionKind::Constant(crate::ir::Constant::Class(class)) => Some(class),
        _ => None,
    }
}

/// Adds `at` to the target's back-reference set. Adding twice is a no-op.
pub(crate) fn link(program: &Program, target: Target, at: InsnRef) {
    match target {
        Target::Field(id) => {
            program.update_field(id, |field| field.references.insert(at));
        }
        Target::Method(id) => {
            program.update_method(id, |method| method.invocations.insert(at));
        }
        Target::Class(id) => {
            program.update_class(id, |class| class.type_references.insert(at));
        }
    }
}

pub(crate) fn unlink(program: &Program, target: Target, at: InsnRef) {
    match target {
        Target::Field(id) => {
            program.update_field(id, |field| field.references.remove(&at));
        }
        Target::Method(id) => {
            program.update_method(id, |method| method.invocations.remove(&at));
        }
        Target::Class(id) => {
            program.update_class(id, |class| class.type_references.remove(&at));
        }
    }
}

/// Resolves one instruction of a live method and links it. Returns the target, if any.
pub fn resolve_instruction(program: &Program, at: InsnRef) -> Option<Target> {
    let (context, kind) = {
        let method = program.method(at.method)?;
        (method.owner, method.instructions.get(at.insn)?.kind.clone())
    };
    let target = lookup_target(program, Some(context), &kind)?;
    link(program, target, at);
    Some(target)
}

/// Removes an instruction from whatever back-reference set it is recorded in.
///
/// `kind` is passed separately so this works for instructions already taken out of their stream.
pub(crate) fn forget_instruction(
    program: &Program,
    context: Option<ClassId>,
    at: InsnRef,
    kind: &InstructionKind,
) {
    if let Some(target) = lookup_target(program, context, kind) {
        unlink(program, target, at);
    }
}

/// Resolves every reference instruction of `method`. Returns how many resolved.
pub fn resolve_method(program: &Program, method: MethodId) -> usize {
    let Some((context, references)) = program.method(method).map(|body| {
        let references: Vec<_> = body
            .instructions
            .iter()
            .filter(|insn| is_reference(&insn.kind))
            .map(|insn| (insn.id, insn.kind.clone()))
            .collect();
        (body.owner, references)
    }) else {
        return 0;
    };

    let mut resolved = 0;
    for (insn, kind) in references {
        if let Some(target) = lookup_target(program, Some(context), &kind) {
            link(program, target, InsnRef::new(method, insn));
            resolved += 1;
        }
    }
    resolved
}

/// Resolves all methods in parallel. Returns the number of linked instructions.
pub fn resolve_all(program: &Program) -> usize {
    program
        .method_ids()
        .par_iter()
        .map(|id| resolve_method(program, *id))
        .sum()
}

pub(crate) fn is_reference(kind: &InstructionKind) -> bool {
    matches!(kind, InstructionKind::Field(_) | InstructionKind::Method(_))
        || referenced_class(kind).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::opcodes;

    #[test]
    fn calls_resolve_to_the_invoked_method() {
        let program = Program::default();
        let class = ClassSpec::new("Sample")
            .static_field("CONSTANT", "I")
            .method(
                MethodSpec::new("<clinit>", "()V")
                    .statik()
                    .int(opcodes::BIPUSH, 42)
                    .field(opcodes::PUTSTATIC, "Sample", "CONSTANT", "I")
                    .op(opcodes::RETURN),
            )
            .method(
                MethodSpec::new("<init>", "()V")
                    .var(opcodes::ALOAD, 0)
                    .invoke(opcodes::INVOKESPECIAL, "java/lang/Object", "<init>", "()V")
                    .op(opcodes::RETURN),
            )
            .method(
                MethodSpec::new("a", "()V")
                    .var(opcodes::ALOAD, 0)
                    .invoke(opcodes::INVOKEVIRTUAL, "Sample", "b", "()V")
                    .op(opcodes::RETURN),
            )
            .method(MethodSpec::new("b", "()V").op(opcodes::RETURN))
            .load(&program);

        resolve_all(&program);

        let a = program.method_by_name(class, "a").expect("a");
        let b = program.find_method_by_name("b").expect("b");
        let invocations = program.method(b).expect("b").invocations().clone();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations.iter().next().map(InsnRef::called_from), Some(a));

        let field = program.find_field("Sample", "CONSTANT").expect("field");
        assert_eq!(program.field(field).expect("field").references().len(), 1);
        assert!(program.consistency_violations().is_empty());
    }

    #[test]
    fn resolution_is_idempotent_and_ignores_library_symbols() {
        let program = Program::default();
        ClassSpec::new("Caller")
            .method(
                MethodSpec::new("run", "()V")
                    .type_insn(opcodes::NEW, "Caller")
                    .op(opcodes::POP)
                    .invoke(opcodes::INVOKESTATIC, "java/lang/System", "gc", "()V")
                    .op(opcodes::RETURN),
            )
            .load(&program);

        assert_eq!(resolve_all(&program), 1);
        assert_eq!(resolve_all(&program), 1);
        let caller = program.find_class("Caller").expect("class");
        assert_eq!(program.class(caller).expect("class").type_references().len(), 1);
    }

    #[test]
    fn field_lookup_falls_back_one_level_to_the_superclass() {
        let program = Program::default();
        ClassSpec::new("Grand").field("deep", "I").load(&program);
        ClassSpec::new("Base").extends("Grand").field("shared", "I").load(&program);
        ClassSpec::new("Child")
            .extends("Base")
            .method(
                MethodSpec::new("read", "()I")
                    .var(opcodes::ALOAD, 0)
                    .field(opcodes::GETFIELD, "Child", "shared", "I")
                    .var(opcodes::ALOAD, 0)
                    .field(opcodes::GETFIELD, "Child", "deep", "I")
                    .op(opcodes::IADD)
                    .op(opcodes::IRETURN),
            )
            .load(&program);

        assert_eq!(resolve_all(&program), 1);
        let shared = program.find_field("Base", "shared").expect("shared");
        let deep = program.find_field("Grand", "deep").expect("deep");
        assert_eq!(program.field(shared).expect("field").references().len(), 1);
        assert!(program.field(deep).expect("field").references().is_empty());
    }
}
