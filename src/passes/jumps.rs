//! Jump threading: branches into `goto` chains go straight to the end of the chain, and a
//! `goto` whose target is a return becomes that return.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::ir::{InsnId, InstructionKind, LabelId, Method};
use crate::mutate;
use crate::opcodes;
use crate::passes::{Node, NodeKind, Pass, PassContext, PassMetadata};
use crate::program::Program;
use crate::stream::InstructionStream;

pub const JUMP_OPTIMIZER: &str = "jump-optimizer";

pub struct JumpOptimizer;

#[derive(Default)]
struct Plan {
    retarget: HashMap<LabelId, LabelId>,
    returns: Vec<(InsnId, u8)>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.retarget.is_empty() && self.returns.is_empty()
    }
}

impl Pass for JumpOptimizer {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: JUMP_OPTIMIZER,
            name: "Jump optimizer",
            description: "Shortcuts jumps through goto chains and gotos to returns",
            kind: NodeKind::Method,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Method(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let Some(plan) = program.method(id).map(|method| plan(&method.instructions)) else {
            return Ok(());
        };
        if plan.is_empty() {
            return Ok(());
        }
        let changed = mutate::edit_method_body(program, id, |method| apply(program, method, &plan))?;
        if let Some(target) = context.method_target(id) {
            context.record(target, format!("rewrote {changed} jumps"));
        }
        Ok(())
    }
}

fn plan(instructions: &InstructionStream) -> Plan {
    let mut plan = Plan::default();
    for insn in instructions.iter() {
        for label in insn.jump_targets() {
            if plan.retarget.contains_key(&label) {
                continue;
            }
            let end = chain_end(instructions, label);
            if end != label {
                plan.retarget.insert(label, end);
            }
        }
    }
    for insn in instructions.iter() {
        let InstructionKind::Jump(label) = insn.kind else {
            continue;
        };
        if insn.opcode != opcodes::GOTO && insn.opcode != opcodes::GOTO_W {
            continue;
        }
        let end = plan.retarget.get(&label).copied().unwrap_or(label);
        if let Some(target) = instructions.real_at_label(end) {
            if opcodes::is_return(target.opcode) {
                plan.returns.push((insn.id(), target.opcode));
            }
        }
    }
    plan
}

/// Follows `goto`s starting at `label` and returns the last label reached. A chain that loops
/// back on itself is left alone.
fn chain_end(instructions: &InstructionStream, label: LabelId) -> LabelId {
    let mut seen = HashSet::from([label]);
    let mut current = label;
    while let Some(next) = instructions.real_at_label(current) {
        let InstructionKind::Jump(target) = next.kind else {
            break;
        };
        if !matches!(next.opcode, opcodes::GOTO | opcodes::GOTO_W) {
            break;
        }
        if !seen.insert(target) {
            return label;
        }
        current = target;
    }
    current
}

fn apply(program: &Program, method: &mut Method, plan: &Plan) -> usize {
    let mut changed = 0;
    for (id, opcode) in &plan.returns {
        let replacement = program.new_instruction(*opcode, InstructionKind::Simple);
        if method.instructions.replace(*id, replacement).is_some() {
            changed += 1;
        }
    }
    for insn in method.instructions.iter_mut() {
        match &mut insn.kind {
            InstructionKind::Jump(label) => {
                if let Some(end) = plan.retarget.get(label) {
                    *label = *end;
                    changed += 1;
                }
            }
            InstructionKind::Switch(switch) => {
                let mut touched = false;
                for label in std::iter::once(&mut switch.default)
                    .chain(switch.cases.iter_mut().map(|(_, label)| label))
                {
                    if let Some(end) = plan.retarget.get(label) {
                        *label = *end;
                        touched = true;
                    }
                }
                changed += usize::from(touched);
            }
            _ => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::passes::Pipeline;

    #[test]
    fn goto_chains_collapse_and_gotos_to_returns_inline() {
        let program = Program::default();
        let class = ClassSpec::new("demo/Flow")
            .method(
                MethodSpec::new("pick", "(I)I")
                    .var(opcodes::ILOAD, 1)
                    .jump(opcodes::IFEQ, "first")
                    .op(opcodes::ICONST_1)
                    .var(opcodes::ISTORE, 1)
                    .jump(opcodes::GOTO, "exit")
                    .label("first")
                    .jump(opcodes::GOTO, "second")
                    .label("second")
                    .jump(opcodes::GOTO, "exit")
                    .label("exit")
                    .var(opcodes::ILOAD, 1)
                    .op(opcodes::IRETURN),
            )
            .load(&program);
        let pick = program.method_by_name(class, "pick").expect("pick");

        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(JumpOptimizer));
        let report = pipeline.run(&program).expect("run");
        assert_eq!(report.edits.len(), 1);

        let method = program.method(pick).expect("pick");
        let instructions = method.instructions();
        let exit = instructions
            .iter()
            .find_map(|insn| match insn.kind {
                InstructionKind::Jump(label) if insn.opcode == opcodes::IFEQ => Some(label),
                _ => None,
            })
            .expect("ifeq");
        assert_eq!(
            instructions.real_at_label(exit).map(|insn| insn.opcode),
            Some(opcodes::ILOAD)
        );
        let targets: Vec<_> = instructions
            .iter()
            .flat_map(|insn| insn.jump_targets())
            .collect();
        assert_eq!(targets, vec![exit; 4]);
        assert!(method.cfg_error().is_none());
    }

    #[test]
    fn goto_to_return_becomes_the_return() {
        let program = Program::default();
        let class = ClassSpec::new("demo/Flow")
            .method(
                MethodSpec::new("run", "(I)V")
                    .var(opcodes::ILOAD, 1)
                    .jump(opcodes::IFNE, "done")
                    .jump(opcodes::GOTO, "done")
                    .label("done")
                    .op(opcodes::RETURN),
            )
            .load(&program);
        let run = program.method_by_name(class, "run").expect("run");

        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(JumpOptimizer));
        pipeline.run(&program).expect("run");

        let method = program.method(run).expect("run");
        let sequence: Vec<_> = method
            .instructions()
            .iter()
            .filter(|insn| !insn.is_label())
            .map(|insn| insn.opcode)
            .collect();
        assert_eq!(
            sequence,
            vec![opcodes::ILOAD, opcodes::IFNE, opcodes::RETURN, opcodes::RETURN]
        );
        assert!(method.cfg_error().is_none());
    }

    #[test]
    fn goto_cycles_terminate() {
        let program = Program::default();
        let class = ClassSpec::new("demo/Flow")
            .method(
                MethodSpec::new("spin", "()V")
                    .label("a")
                    .jump(opcodes::GOTO, "b")
                    .label("b")
                    .jump(opcodes::GOTO, "a"),
            )
            .load(&program);
        let spin = program.method_by_name(class, "spin").expect("spin");
        let plan = plan(&program.method(spin).expect("spin").instructions);
        assert!(plan.is_empty());
    }
}
