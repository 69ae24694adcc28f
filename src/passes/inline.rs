//! Folds constant stores in static initializers into ConstantValue attributes.

use anyhow::Result;

use crate::ir::{Access, AccessFlags, Constant, FieldInsn, InsnId, Instruction, InstructionKind};
use crate::mutate;
use crate::opcodes;
use crate::passes::{Node, NodeKind, Pass, PassContext, PassMetadata};

pub const STATIC_FIELD_INLINER: &str = "static-field-inliner";

/// Turns `<clinit>` sequences `push constant; putstatic Own.field` into the field's constant
/// value when the field is `static final`, has no value yet and that store is its only use.
pub struct StaticFieldInliner;

struct Store {
    push: InsnId,
    put: InsnId,
    name: String,
    value: Constant,
}

impl Pass for StaticFieldInliner {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: STATIC_FIELD_INLINER,
            name: "Static field inliner",
            description: "Moves compile-time constant stores from static initializers into fields",
            kind: NodeKind::Class,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Class(class) = node else {
            return Ok(());
        };
        let program = context.program();
        let Some(owner) = program.class_name(class) else {
            return Ok(());
        };
        let Some(initializer) = program.method_by_name(class, "<clinit>") else {
            return Ok(());
        };
        let stores: Vec<Store> = program
            .method(initializer)
            .map(|method| {
                method
                    .instructions()
                    .as_slice()
                    .windows(2)
                    .filter_map(|pair| constant_store(&owner, &pair[0], &pair[1]))
                    .collect()
            })
            .unwrap_or_default();

        for store in stores {
            let Some(field) = program.find_field(&owner, &store.name) else {
                continue;
            };
            let foldable = program.field(field).is_some_and(|field| {
                field.access().contains(AccessFlags::STATIC | AccessFlags::FINAL)
                    && field.value.is_none()
                    && field.references().len() == 1
                    && fits(&store.value, field.descriptor())
            });
            if !foldable {
                continue;
            }
            let Some(target) = context.field_target(field) else {
                continue;
            };
            mutate::delete_instructions(program, initializer, &[store.push, store.put])?;
            let message = format!("inlined constant {:?}", store.value);
            program.update_field(field, |field| field.value = Some(store.value));
            context.record(target, message);
        }
        Ok(())
    }
}

fn constant_store(owner: &str, push: &Instruction, put: &Instruction) -> Option<Store> {
    let InstructionKind::Field(FieldInsn { owner: target, name, .. }) = &put.kind else {
        return None;
    };
    if put.opcode != opcodes::PUTSTATIC || target != owner {
        return None;
    }
    Some(Store {
        push: push.id(),
        put: put.id(),
        name: name.clone(),
        value: pushed_constant(push)?,
    })
}

/// Constant pushed by a constant-loading instruction.
fn pushed_constant(insn: &Instruction) -> Option<Constant> {
    let opcode = insn.opcode;
    match (&insn.kind, opcode) {
        (InstructionKind::Simple, opcodes::ICONST_M1..=opcodes::ICONST_5) => {
            Some(Constant::Int(i32::from(opcode) - i32::from(opcodes::ICONST_0)))
        }
        (InstructionKind::Simple, opcodes::LCONST_0..=opcodes::LCONST_1) => {
            Some(Constant::Long(i64::from(opcode - opcodes::LCONST_0)))
        }
        (InstructionKind::Simple, opcodes::FCONST_0..=opcodes::FCONST_2) => {
            Some(Constant::Float(f32::from(opcode - opcodes::FCONST_0)))
        }
        (InstructionKind::Simple, opcodes::DCONST_0..=opcodes::DCONST_1) => {
            Some(Constant::Double(f64::from(opcode - opcodes::DCONST_0)))
        }
        (InstructionKind::Int(value), opcodes::BIPUSH | opcodes::SIPUSH) => {
            Some(Constant::Int(*value))
        }
        (
            InstructionKind::Constant(
                constant @ (Constant::Int(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::String(_)),
            ),
            _,
        ) => Some(constant.clone()),
        _ => None,
    }
}

/// Whether a ConstantValue of this kind is legal for a field of `descriptor`.
fn fits(value: &Constant, descriptor: &str) -> bool {
    matches!(
        (value, descriptor),
        (Constant::Int(_), "I" | "S" | "B" | "C" | "Z")
            | (Constant::Long(_), "J")
            | (Constant::Float(_), "F")
            | (Constant::Double(_), "D")
            | (Constant::String(_), "Ljava/lang/String;")
    )
}
