//! Removers for fields and methods nothing refers to.

use std::collections::HashSet;

use anyhow::Result;

use crate::ir::{Access, AccessFlags, Constant, InstructionKind};
use crate::passes::{
    Node, NodeKind, Pass, PassContext, PassMetadata, in_override_family, is_entry_point,
};
use crate::program::Program;
use crate::resolve;

pub const UNUSED_FIELD_REMOVER: &str = "unused-field-remover";
pub const UNUSED_METHOD_REMOVER: &str = "unused-method-remover";
pub const ABSTRACT_METHOD_REMOVER: &str = "abstract-method-remover";

/// Member names used in ways back-references cannot see: instructions that did not resolve
/// (the owner named at the call site only inherits the member) and method handles.
#[derive(Default)]
struct HiddenUses {
    fields: HashSet<(String, String)>,
    methods: HashSet<(String, String)>,
}

impl HiddenUses {
    fn collect(program: &Program) -> Self {
        let mut uses = Self::default();
        for id in program.method_ids() {
            let Some((owner, kinds)) = program.method(id).map(|method| {
                let kinds: Vec<_> = method
                    .instructions()
                    .iter()
                    .filter(|insn| {
                        matches!(
                            insn.kind,
                            InstructionKind::Field(_)
                                | InstructionKind::Method(_)
                                | InstructionKind::Constant(Constant::MethodHandle { .. })
                        )
                    })
                    .map(|insn| insn.kind.clone())
                    .collect();
                (method.owner(), kinds)
            }) else {
                continue;
            };
            for kind in kinds {
                match &kind {
                    InstructionKind::Constant(handle) => uses.add_handle(handle),
                    _ if resolve::lookup_target(program, Some(owner), &kind).is_some() => {}
                    InstructionKind::Field(field) => {
                        uses.fields
                            .insert((field.name.clone(), field.descriptor.clone()));
                    }
                    InstructionKind::Method(call) => {
                        uses.methods
                            .insert((call.name.clone(), call.descriptor.clone()));
                    }
                    _ => {}
                }
            }
        }
        for id in program.class_ids() {
            let Some(bootstrap) = program
                .class(id)
                .map(|class| class.bootstrap_methods().to_vec())
            else {
                continue;
            };
            for method in &bootstrap {
                uses.add_handle(&method.handle);
                for argument in &method.arguments {
                    uses.add_handle(argument);
                }
            }
        }
        uses
    }

    fn add_handle(&mut self, constant: &Constant) {
        if let Constant::MethodHandle {
            kind,
            name,
            descriptor,
            ..
        } = constant
        {
            // Reference kinds 1 to 4 are field getters and setters.
            if *kind <= 4 {
                self.fields.insert((name.clone(), descriptor.clone()));
            } else {
                self.methods.insert((name.clone(), descriptor.clone()));
            }
        }
    }
}

#[derive(Default)]
pub struct UnusedFieldRemover {
    hidden: Option<HiddenUses>,
}

impl Pass for UnusedFieldRemover {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: UNUSED_FIELD_REMOVER,
            name: "Unused field remover",
            description: "Deletes fields that no instruction reads or writes",
            kind: NodeKind::Field,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Field(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let hidden = self
            .hidden
            .get_or_insert_with(|| HiddenUses::collect(program));
        let unused = program.field(id).is_some_and(|field| {
            field.references().is_empty()
                && field.name() != "serialVersionUID"
                && !field.access().contains(AccessFlags::ENUM)
                && !hidden
                    .fields
                    .contains(&(field.name().to_string(), field.descriptor().to_string()))
        });
        if unused {
            context.delete_field(id)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct UnusedMethodRemover {
    hidden: Option<HiddenUses>,
}

impl Pass for UnusedMethodRemover {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: UNUSED_METHOD_REMOVER,
            name: "Unused method remover",
            description: "Deletes methods that are never invoked and cannot be dispatched to",
            kind: NodeKind::Method,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Method(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let hidden = self
            .hidden
            .get_or_insert_with(|| HiddenUses::collect(program));
        let unused = program.method(id).is_some_and(|method| {
            method.invocations().is_empty()
                && !method.is_abstract()
                && !method.access().contains(AccessFlags::NATIVE)
                && !hidden
                    .methods
                    .contains(&(method.name().to_string(), method.descriptor().to_string()))
        });
        if unused && !is_entry_point(program, id) && !in_override_family(program, id) {
            context.delete_method(id)?;
        }
        Ok(())
    }
}

/// Deletes abstract methods of classes that are never invoked. Interface methods stay, since
/// they define the contract of implementations that may live outside the scanned program.
#[derive(Default)]
pub struct AbstractMethodRemover {
    hidden: Option<HiddenUses>,
}

impl Pass for AbstractMethodRemover {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: ABSTRACT_METHOD_REMOVER,
            name: "Abstract method remover",
            description: "Deletes abstract class methods that are never invoked",
            kind: NodeKind::Method,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Method(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let hidden = self
            .hidden
            .get_or_insert_with(|| HiddenUses::collect(program));
        let Some((owner, removable)) = program.method(id).map(|method| {
            (
                method.owner(),
                method.is_abstract()
                    && method.invocations().is_empty()
                    && !hidden
                        .methods
                        .contains(&(method.name().to_string(), method.descriptor().to_string())),
            )
        }) else {
            return Ok(());
        };
        let in_interface = program.class(owner).is_some_and(|class| class.is_interface());
        if removable && !in_interface {
            context.delete_method(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::hierarchy;
    use crate::opcodes;
    use crate::passes::Pipeline;

    fn sample(program: &Program) {
        ClassSpec::new("demo/Base")
            .access(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)
            .field("used", "I")
            .field("unused", "J")
            .static_field("serialVersionUID", "J")
            .method(MethodSpec::new("shape", "()I").abstract_())
            .method(MethodSpec::new("called", "()I").abstract_())
            .method(
                MethodSpec::new("read", "()I")
                    .var(opcodes::ALOAD, 0)
                    .field(opcodes::GETFIELD, "demo/Base", "used", "I")
                    .var(opcodes::ALOAD, 0)
                    .invoke(opcodes::INVOKEVIRTUAL, "demo/Base", "called", "()I")
                    .op(opcodes::IADD)
                    .op(opcodes::IRETURN),
            )
            .method(MethodSpec::new("helper", "()V").op(opcodes::RETURN))
            .method(MethodSpec::new("inherited", "()V").op(opcodes::RETURN))
            .method(
                MethodSpec::new("main", "([Ljava/lang/String;)V")
                    .statik()
                    .op(opcodes::RETURN),
            )
            .load(program);
        ClassSpec::new("demo/Caller")
            .method(
                MethodSpec::new("run", "(Ldemo/Sub;)V")
                    .var(opcodes::ALOAD, 1)
                    .invoke(opcodes::INVOKEVIRTUAL, "demo/Sub", "inherited", "()V")
                    .op(opcodes::RETURN),
            )
            .load(program);
        ClassSpec::new("demo/Api")
            .interface()
            .method(MethodSpec::new("contract", "()V").abstract_())
            .load(program);
        hierarchy::link_hierarchy(program);
        resolve::resolve_all(program);
    }

    fn run(program: &Program, pass: Box<dyn Pass>) -> usize {
        let mut pipeline = Pipeline::new();
        pipeline.add(pass);
        pipeline.run(program).expect("run").edits.len()
    }

    #[test]
    fn unused_fields_are_deleted() {
        let program = Program::default();
        sample(&program);

        assert_eq!(run(&program, Box::new(UnusedFieldRemover::default())), 1);
        assert!(program.find_field("demo/Base", "unused").is_none());
        assert!(program.find_field("demo/Base", "used").is_some());
        assert!(program.find_field("demo/Base", "serialVersionUID").is_some());
        assert!(program.consistency_violations().is_empty());
    }

    #[test]
    fn unused_methods_are_deleted_unless_reachable_by_name() {
        let program = Program::default();
        sample(&program);

        run(&program, Box::new(UnusedMethodRemover::default()));

        assert!(program.find_method("demo/Base", "helper", "()V").is_none());
        // Called through `demo/Sub`, which was never scanned.
        assert!(program.find_method("demo/Base", "inherited", "()V").is_some());
        assert!(
            program
                .find_method("demo/Base", "main", "([Ljava/lang/String;)V")
                .is_some()
        );
        assert!(program.find_method("demo/Base", "called", "()I").is_some());
        assert!(program.consistency_violations().is_empty());
    }

    #[test]
    fn abstract_methods_are_deleted_outside_interfaces() {
        let program = Program::default();
        sample(&program);

        assert_eq!(run(&program, Box::new(AbstractMethodRemover::default())), 1);
        assert!(program.find_method("demo/Base", "shape", "()I").is_none());
        assert!(program.find_method("demo/Base", "called", "()I").is_some());
        assert!(program.find_method("demo/Api", "contract", "()V").is_some());
    }
}
