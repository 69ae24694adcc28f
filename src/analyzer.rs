//! Data-flow analyzer over operand-stack heights.
//!
//! The analyzer abstractly interprets a method body, tracking only how many stack slots are
//! live at each instruction. That is enough to find every reachable instruction, reject
//! malformed bodies (underflow, inconsistent merges, overflow, falling off the end) and report
//! each control transfer it follows to a [`FlowListener`].

use std::collections::HashMap;

use crate::descriptor;
use crate::error::AnalyzerError;
use crate::ir::{CallKind, InstructionKind, LabelId, Method, TryCatch};
use crate::opcodes;
use crate::stream::InstructionStream;

/// Receives the control transfers found during analysis, as stream positions.
pub trait FlowListener {
    fn on_flow_edge(&mut self, from: usize, to: usize);

    fn on_exception_edge(&mut self, from: usize, handler: usize);
}

impl FlowListener for () {
    fn on_flow_edge(&mut self, _from: usize, _to: usize) {}

    fn on_exception_edge(&mut self, _from: usize, _handler: usize) {}
}

/// Stack height before each instruction; `None` for unreachable ones.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frames {
    heights: Vec<Option<usize>>,
}

impl Frames {
    pub fn height(&self, position: usize) -> Option<usize> {
        self.heights.get(position).copied().flatten()
    }

    pub fn is_reachable(&self, position: usize) -> bool {
        self.height(position).is_some()
    }

    /// Deepest stack seen on entry to any instruction, which is the method's max_stack.
    pub fn max_height(&self) -> usize {
        self.heights.iter().flatten().copied().max().unwrap_or(0)
    }

    pub fn reachable_count(&self) -> usize {
        self.heights.iter().filter(|height| height.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }
}

struct Handler {
    start: usize,
    end: usize,
    entry: usize,
}

/// Analyzer for one method body.
pub struct FlowAnalyzer<'m> {
    instructions: &'m InstructionStream,
    try_catch: &'m [TryCatch],
    max_stack: Option<u16>,
}

impl<'m> FlowAnalyzer<'m> {
    pub fn new(method: &'m Method) -> Self {
        Self::with_parts(&method.instructions, &method.try_catch, method.max_stack)
    }

    pub fn with_parts(
        instructions: &'m InstructionStream,
        try_catch: &'m [TryCatch],
        max_stack: Option<u16>,
    ) -> Self {
        Self {
            instructions,
            try_catch,
            max_stack,
        }
    }

    /// Runs the analysis, reporting each followed edge exactly once.
    pub fn analyze(&self, listener: &mut dyn FlowListener) -> Result<Frames, AnalyzerError> {
        let count = self.instructions.len();
        let mut frames = Frames {
            heights: vec![None; count],
        };
        if count == 0 {
            return Ok(frames);
        }

        let labels: HashMap<LabelId, usize> = self
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(position, insn)| insn.label().map(|label| (label, position)))
            .collect();
        let handlers = self.handlers(&labels)?;

        let mut worklist = vec![0usize];
        frames.heights[0] = Some(0);

        while let Some(position) = worklist.pop() {
            let Some(height) = frames.heights[position] else {
                continue;
            };
            let Some(insn) = self.instructions.at(position) else {
                continue;
            };

            for handler in handlers
                .iter()
                .filter(|handler| handler.start <= position && position < handler.end)
            {
                listener.on_exception_edge(position, handler.entry);
                merge(&mut frames, &mut worklist, handler.entry, 1)?;
            }

            let (pop, push) = effect(insn.opcode, &insn.kind, position)?;
            if height < pop {
                return Err(AnalyzerError::StackUnderflow { position });
            }
            let after = height - pop + push;
            if let Some(max) = self.max_stack.map(usize::from) {
                if after > max {
                    return Err(AnalyzerError::StackOverflow {
                        position,
                        height: after,
                        max,
                    });
                }
            }

            let target = |label: LabelId| {
                labels
                    .get(&label)
                    .copied()
                    .ok_or(AnalyzerError::UnknownLabel { position })
            };
            let mut successors: Vec<(usize, usize)> = Vec::new();
            match &insn.kind {
                InstructionKind::Jump(label) => {
                    let to = target(*label)?;
                    if opcodes::is_subroutine_call(insn.opcode) {
                        successors.push((to, after));
                        successors.push((self.next(position)?, height));
                    } else if opcodes::is_unconditional_branch(insn.opcode) {
                        successors.push((to, after));
                    } else {
                        successors.push((self.next(position)?, after));
                        successors.push((to, after));
                    }
                }
                InstructionKind::Switch(switch) => {
                    for label in switch.targets() {
                        let to = target(label)?;
                        if !successors.iter().any(|(seen, _)| *seen == to) {
                            successors.push((to, after));
                        }
                    }
                }
                _ if opcodes::is_exit_opcode(insn.opcode) => {}
                _ => successors.push((self.next(position)?, after)),
            }

            for (to, height) in successors {
                listener.on_flow_edge(position, to);
                merge(&mut frames, &mut worklist, to, height)?;
            }
        }

        Ok(frames)
    }

    fn next(&self, position: usize) -> Result<usize, AnalyzerError> {
        let next = position + 1;
        if next >= self.instructions.len() {
            return Err(AnalyzerError::FallOffEnd { position });
        }
        Ok(next)
    }

    fn handlers(&self, labels: &HashMap<LabelId, usize>) -> Result<Vec<Handler>, AnalyzerError> {
        self.try_catch
            .iter()
            .map(|try_catch| {
                let resolve = |label: LabelId| {
                    labels
                        .get(&label)
                        .copied()
                        .ok_or(AnalyzerError::UnknownLabel { position: 0 })
                };
                Ok(Handler {
                    start: resolve(try_catch.start)?,
                    end: resolve(try_catch.end)?,
                    entry: resolve(try_catch.handler)?,
                })
            })
            .collect()
    }
}

fn merge(
    frames: &mut Frames,
    worklist: &mut Vec<usize>,
    position: usize,
    height: usize,
) -> Result<(), AnalyzerError> {
    match frames.heights[position] {
        None => {
            frames.heights[position] = Some(height);
            worklist.push(position);
            Ok(())
        }
        Some(existing) if existing == height => Ok(()),
        Some(existing) => Err(AnalyzerError::InconsistentStack {
            position,
            expected: existing,
            found: height,
        }),
    }
}

/// Slots popped and pushed by one instruction.
fn effect(opcode: u8, kind: &InstructionKind, position: usize) -> Result<(usize, usize), AnalyzerError> {
    let descriptor_error = |descriptor: &str| AnalyzerError::Descriptor {
        position,
        descriptor: descriptor.to_string(),
    };
    let effect = match kind {
        InstructionKind::Label(_) => (0, 0),
        InstructionKind::Constant(constant) => (0, constant.slots()),
        InstructionKind::Field(field) => {
            let slots = descriptor::field_slots(&field.descriptor);
            match opcode {
                opcodes::GETSTATIC => (0, slots),
                opcodes::PUTSTATIC => (slots, 0),
                opcodes::GETFIELD => (1, slots),
                _ => (1 + slots, 0),
            }
        }
        InstructionKind::Method(call) => {
            let (arguments, returned) = descriptor::method_slots(&call.descriptor)
                .ok_or_else(|| descriptor_error(&call.descriptor))?;
            let receiver = usize::from(call.kind != CallKind::Static);
            (arguments + receiver, returned)
        }
        InstructionKind::InvokeDynamic(dynamic) => descriptor::method_slots(&dynamic.descriptor)
            .ok_or_else(|| descriptor_error(&dynamic.descriptor))?,
        InstructionKind::MultiANewArray { dimensions, .. } => (*dimensions as usize, 1),
        _ => opcodes::stack_effect(opcode).unwrap_or((0, 0)),
    };
    Ok(effect)
}
