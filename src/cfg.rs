//! Block Builder: partitions a method body into basic blocks and connects them.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::analyzer::{FlowAnalyzer, FlowListener};
use crate::error::AnalyzerError;
use crate::ir::{
    AnnotationValue, Block, BlockId, ControlFlowGraph, EdgeKind, FlowEdge, LabelId, Method,
    MethodId,
};
use crate::opcodes;
use crate::program::Program;

/// Build a control flow graph for one method body.
///
/// Blocks always partition the whole stream, reachable or not. Edges come from the flow
/// analyzer; if it rejects the body the blocks are kept and the error is returned alongside.
pub fn build_cfg(method: &Method) -> (ControlFlowGraph, Option<AnalyzerError>) {
    let instructions = method.instructions.as_slice();
    if instructions.is_empty() {
        return (ControlFlowGraph::default(), None);
    }

    let labels: HashMap<LabelId, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(position, insn)| insn.label().map(|label| (label, position)))
        .collect();

    let mut builder = BlockBuilder::new(instructions.len());
    for (position, insn) in instructions.iter().enumerate() {
        let targets = insn.jump_targets();
        if !targets.is_empty() {
            builder.ensure_block_at(position + 1);
            for label in targets {
                if let Some(target) = labels.get(&label) {
                    builder.ensure_block_at(*target);
                    builder.jumps.insert((position, *target));
                }
            }
        } else if opcodes::is_exit_opcode(insn.opcode) {
            builder.ensure_block_at(position + 1);
        }
    }
    for try_catch in &method.try_catch {
        for label in [try_catch.start, try_catch.end, try_catch.handler] {
            if let Some(position) = labels.get(&label) {
                builder.ensure_block_at(*position);
            }
        }
    }

    let error = FlowAnalyzer::new(method).analyze(&mut builder).err();
    (builder.finish(method), error)
}

/// Block starts plus the edges reported by the analyzer, as stream positions.
struct BlockBuilder {
    len: usize,
    starts: BTreeSet<usize>,
    /// (jump position, target position) for every jump and switch operand.
    jumps: BTreeSet<(usize, usize)>,
    edges: BTreeSet<(usize, usize, EdgeKind)>,
}

impl BlockBuilder {
    fn new(len: usize) -> Self {
        Self {
            len,
            starts: BTreeSet::from([0]),
            jumps: BTreeSet::new(),
            edges: BTreeSet::new(),
        }
    }

    /// Makes `position` start a block, splitting the block it falls in. A position that already
    /// starts a block keeps it. Returns false for positions past the end.
    fn ensure_block_at(&mut self, position: usize) -> bool {
        if position >= self.len {
            return false;
        }
        self.starts.insert(position);
        true
    }

    fn finish(self, method: &Method) -> ControlFlowGraph {
        let instructions = method.instructions.as_slice();
        let starts: Vec<usize> = self.starts.into_iter().collect();
        let mut block_of = vec![0usize; self.len];
        let mut blocks = Vec::with_capacity(starts.len());
        for (index, start) in starts.iter().enumerate() {
            let end = starts.get(index + 1).copied().unwrap_or(self.len);
            block_of[*start..end].fill(index);
            blocks.push(Block {
                id: BlockId(index as u32),
                instructions: instructions[*start..end].iter().map(|insn| insn.id).collect(),
            });
        }

        let mut exception_pairs = BTreeSet::new();
        let mut edges = Vec::with_capacity(self.edges.len());
        for (from, to, kind) in self.edges {
            let (source, target) = (block_of[from], block_of[to]);
            if kind == EdgeKind::Exception && !exception_pairs.insert((source, target)) {
                continue;
            }
            edges.push(FlowEdge {
                from: BlockId(source as u32),
                to: BlockId(target as u32),
                kind,
                source: instructions[from].id,
            });
        }
        edges.sort();
        ControlFlowGraph { blocks, edges }
    }
}

impl FlowListener for BlockBuilder {
    fn on_flow_edge(&mut self, from: usize, to: usize) {
        if !self.starts.contains(&to) {
            // Straight-line flow inside one block.
            if to == from + 1 || !self.ensure_block_at(to) {
                return;
            }
        }
        let kind = if self.jumps.contains(&(from, to)) {
            EdgeKind::Branch
        } else {
            EdgeKind::FallThrough
        };
        self.edges.insert((from, to, kind));
    }

    fn on_exception_edge(&mut self, from: usize, handler: usize) {
        if self.ensure_block_at(handler) {
            self.edges.insert((from, handler, EdgeKind::Exception));
        }
    }
}

/// Rebuilds the stored graph of one method. Returns the analysis error, if any.
pub fn rebuild_cfg(program: &Program, id: MethodId) -> Option<AnalyzerError> {
    let error = program.update_method(id, |method| {
        let (graph, error) = build_cfg(method);
        method.cfg = graph;
        method.cfg_error = error.clone();
        error
    })??;
    let name = program
        .method_qualified_name(id)
        .unwrap_or_else(|| format!("{id:?}"));
    warn!(method = %name, %error, "control flow analysis failed");
    Some(error)
}

/// Builds every method's graph in parallel and applies the configured method annotations.
/// Returns the number of methods whose analysis failed.
pub fn build_all(program: &Program) -> usize {
    let failures = program
        .method_ids()
        .par_iter()
        .filter(|id| {
            let failed = rebuild_cfg(program, **id).is_some();
            annotate_method(program, **id);
            failed
        })
        .count();
    debug!(failures, "control flow graphs built");
    failures
}

/// Method annotations driven by [`crate::settings::Settings`].
pub fn annotate_method(program: &Program, id: MethodId) {
    let settings = program.settings();
    if !(settings.annotate_method_complexity
        || settings.annotate_try_catch_count
        || settings.annotate_local_variables)
    {
        return;
    }
    let (analyzed, complexity, try_catch, variables) = {
        let Some(method) = program.method(id) else {
            return;
        };
        (
            method.cfg_error.is_none(),
            (method.cfg.blocks.len(), method.cfg.edges.len()),
            method.try_catch.len(),
            method
                .local_variables
                .iter()
                .map(|variable| (variable.name.clone(), variable.references.len()))
                .collect::<Vec<_>>(),
        )
    };
    if settings.annotate_method_complexity && analyzed {
        program.annotate_method(
            id,
            "Complexity",
            vec![
                ("Blocks".to_string(), AnnotationValue::from(complexity.0)),
                ("Edges".to_string(), AnnotationValue::from(complexity.1)),
            ],
        );
    }
    if settings.annotate_try_catch_count {
        program.annotate_method(
            id,
            "TryCatchs",
            vec![("number".to_string(), AnnotationValue::from(try_catch))],
        );
    }
    if settings.annotate_local_variables {
        for (name, references) in variables {
            program.annotate_method(
                id,
                "LocalVariable",
                vec![
                    ("name".to_string(), AnnotationValue::from(name)),
                    ("References".to_string(), AnnotationValue::from(references)),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::ir::InsnId;
    use crate::settings::Settings;

    fn built(spec: MethodSpec) -> (Program, MethodId) {
        let program = Program::default();
        let class = ClassSpec::new("T").method(spec).load(&program);
        let id = program.class(class).expect("class").methods()[0];
        rebuild_cfg(&program, id);
        (program, id)
    }

    fn assert_partition(method: &Method) {
        let covered: Vec<InsnId> = method
            .blocks()
            .iter()
            .flat_map(|block| block.instructions.iter().copied())
            .collect();
        let stream: Vec<InsnId> = method.instructions().iter().map(|insn| insn.id()).collect();
        assert_eq!(covered, stream, "blocks must partition the stream in order");
        assert!(method.blocks().iter().all(|block| !block.is_empty()));
        for edge in &method.cfg().edges {
            assert!(method.cfg().block(edge.from).is_some());
            assert!(method.cfg().block(edge.to).is_some());
        }
    }

    #[test]
    fn try_catch_produces_an_exception_edge() {
        let (program, id) = built(
            MethodSpec::new("f", "()V")
                .label("start")
                .op(opcodes::ICONST_1)
                .op(opcodes::ICONST_2)
                .op(opcodes::POP2)
                .label("end")
                .op(opcodes::RETURN)
                .label("handler")
                .op(opcodes::POP)
                .op(opcodes::RETURN)
                .try_catch("start", "end", "handler", Some("java/lang/Exception")),
        );
        let method = program.method(id).expect("method");
        assert!(method.cfg_error().is_none());
        assert_partition(&method);

        let try_catch = &method.try_catch_blocks()[0];
        let try_block = method.try_block(try_catch).expect("try block");
        let catch_block = method.catch_block(try_catch).expect("catch block");
        assert_eq!(try_block.len(), 4);
        assert_eq!(catch_block.len(), 3);
        assert!(
            method
                .cfg()
                .has_edge(try_block.id, catch_block.id, EdgeKind::Exception)
        );
        assert_eq!(method.cfg().exception_edges().count(), 1);
    }

    #[test]
    fn loops_keep_their_self_edge() {
        let (program, id) = built(
            MethodSpec::new("spin", "()V")
                .label("top")
                .op(opcodes::NOP)
                .jump(opcodes::GOTO, "top"),
        );
        let method = program.method(id).expect("method");
        assert_partition(&method);
        assert_eq!(method.blocks().len(), 1);
        let block = method.blocks()[0].id;
        assert!(method.cfg().has_edge(block, block, EdgeKind::Branch));
    }

    #[test]
    fn jump_to_the_next_label_still_splits() {
        let (program, id) = built(
            MethodSpec::new("hop", "()V")
                .jump(opcodes::GOTO, "next")
                .label("next")
                .op(opcodes::RETURN),
        );
        let method = program.method(id).expect("method");
        assert_partition(&method);
        assert_eq!(method.blocks().len(), 2);
        assert!(
            method
                .cfg()
                .has_edge(BlockId(0), BlockId(1), EdgeKind::Branch)
        );
    }

    #[test]
    fn code_after_a_return_starts_its_own_block() {
        let (program, id) = built(
            MethodSpec::new("f", "()I")
                .op(opcodes::ICONST_0)
                .op(opcodes::IRETURN)
                .op(opcodes::NOP)
                .op(opcodes::ICONST_1)
                .op(opcodes::IRETURN),
        );
        let method = program.method(id).expect("method");
        assert!(method.cfg_error().is_none());
        assert_partition(&method);
        assert_eq!(method.blocks().len(), 2);
        assert_eq!(method.blocks()[0].len(), 2);
        let tail = method.blocks()[1].id;
        assert_eq!(method.cfg().predecessors(tail).count(), 0);
        assert_eq!(method.cfg().successors(BlockId(0)).count(), 0);
    }

    #[test]
    fn shared_targets_and_dead_code() {
        let (program, id) = built(
            MethodSpec::new("f", "(I)V")
                .op(opcodes::ILOAD_1)
                .jump(opcodes::IFEQ, "exit")
                .jump(opcodes::GOTO, "exit")
                .op(opcodes::NOP)
                .op(opcodes::NOP)
                .label("exit")
                .op(opcodes::RETURN),
        );
        let method = program.method(id).expect("method");
        assert_partition(&method);
        // [iload, ifeq] [goto] [nop nop] [exit return]
        assert_eq!(method.blocks().len(), 4);
        let exit = method.blocks()[3].id;
        assert_eq!(method.cfg().predecessors(exit).count(), 2);
        let dead = method.blocks()[2].id;
        assert_eq!(method.cfg().predecessors(dead).count(), 0);
        assert_eq!(method.cfg().successors(dead).count(), 0);
        assert!(method.cfg().has_edge(BlockId(0), BlockId(1), EdgeKind::FallThrough));
    }

    #[test]
    fn failed_analysis_keeps_blocks_and_records_the_error() {
        let (program, id) = built(
            MethodSpec::new("broken", "()V")
                .op(opcodes::POP)
                .op(opcodes::RETURN),
        );
        let method = program.method(id).expect("method");
        assert!(matches!(
            method.cfg_error(),
            Some(AnalyzerError::StackUnderflow { position: 0 })
        ));
        assert_partition(&method);
        assert!(method.cfg().edges.is_empty());
    }

    #[test]
    fn settings_drive_method_annotations() {
        let settings = Settings {
            annotate_method_complexity: true,
            annotate_try_catch_count: true,
            ..Settings::default()
        };
        let program = Program::new(settings);
        ClassSpec::new("T")
            .method(MethodSpec::new("f", "()V").op(opcodes::RETURN))
            .load(&program);

        assert_eq!(build_all(&program), 0);
        let id = program.find_method_by_name("f").expect("method");
        let method = program.method(id).expect("method");
        let complexity = method
            .annotations
            .iter()
            .find(|annotation| annotation.descriptor == "LComplexity;")
            .expect("complexity annotation");
        assert_eq!(complexity.value("Blocks"), Some(&AnnotationValue::Int(1)));
        assert_eq!(complexity.value("Edges"), Some(&AnnotationValue::Int(0)));
        assert!(
            method
                .annotations
                .iter()
                .any(|annotation| annotation.descriptor == "LTryCatchs;")
        );
    }
}
