//! Drops instructions the flow analyzer never reaches.

use anyhow::Result;

use crate::analyzer::FlowAnalyzer;
use crate::mutate;
use crate::passes::{Node, NodeKind, Pass, PassContext, PassMetadata};

pub const DEAD_CODE_REMOVER: &str = "dead-code-remover";

/// Labels are kept so try/catch ranges and local-variable scopes stay well formed. Methods
/// whose analysis fails are left untouched.
pub struct DeadCodeRemover;

impl Pass for DeadCodeRemover {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: DEAD_CODE_REMOVER,
            name: "Dead code remover",
            description: "Deletes unreachable instructions",
            kind: NodeKind::Method,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Method(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let dead: Vec<_> = {
            let Some(method) = program.method(id) else {
                return Ok(());
            };
            let Ok(frames) = FlowAnalyzer::new(&method).analyze(&mut ()) else {
                return Ok(());
            };
            method
                .instructions()
                .iter()
                .enumerate()
                .filter(|(position, insn)| !insn.is_label() && !frames.is_reachable(*position))
                .map(|(_, insn)| insn.id())
                .collect()
        };
        if dead.is_empty() {
            return Ok(());
        }
        let removed = mutate::delete_instructions(program, id, &dead)?;
        if let Some(target) = context.method_target(id) {
            context.record(target, format!("removed {removed} unreachable instructions"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::opcodes;
    use crate::passes::Pipeline;
    use crate::program::Program;
    use crate::resolve;

    #[test]
    fn unreachable_code_and_its_references_are_removed() {
        let program = Program::default();
        ClassSpec::new("demo/Dead")
            .static_field("hits", "I")
            .method(
                MethodSpec::new("run", "()V")
                    .statik()
                    .jump(opcodes::GOTO, "end")
                    .op(opcodes::ICONST_1)
                    .field(opcodes::PUTSTATIC, "demo/Dead", "hits", "I")
                    .label("end")
                    .op(opcodes::RETURN),
            )
            .method(
                MethodSpec::new("live", "()I")
                    .statik()
                    .field(opcodes::GETSTATIC, "demo/Dead", "hits", "I")
                    .op(opcodes::IRETURN),
            )
            .load(&program);
        resolve::resolve_all(&program);
        let hits = program.find_field("demo/Dead", "hits").expect("hits");
        assert_eq!(program.field(hits).expect("hits").references().len(), 2);

        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(DeadCodeRemover));
        let report = pipeline.run(&program).expect("run");

        assert_eq!(report.edits.len(), 1);
        assert_eq!(report.edits[0].message, "removed 2 unreachable instructions");
        let run = program
            .find_method("demo/Dead", "run", "()V")
            .expect("run");
        let sequence: Vec<_> = program
            .method(run)
            .expect("run")
            .instructions()
            .iter()
            .filter(|insn| !insn.is_label())
            .map(|insn| insn.opcode)
            .collect();
        assert_eq!(sequence, vec![opcodes::GOTO, opcodes::RETURN]);
        assert_eq!(program.field(hits).expect("hits").references().len(), 1);
        assert!(program.consistency_violations().is_empty());
    }
}
