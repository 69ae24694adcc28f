use crate::ir::{InsnId, Instruction, LabelId};

/// Ordered, mutable instruction list of one method, addressed by instruction identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstructionStream {
    instructions: Vec<Instruction>,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Instruction> {
        self.instructions.iter_mut()
    }

    pub fn as_slice(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn first(&self) -> Option<&Instruction> {
        self.instructions.first()
    }

    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    pub fn at(&self, position: usize) -> Option<&Instruction> {
        self.instructions.get(position)
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn position(&self, id: InsnId) -> Option<usize> {
        self.instructions.iter().position(|insn| insn.id == id)
    }

    pub fn contains(&self, id: InsnId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: InsnId) -> Option<&Instruction> {
        self.instructions.iter().find(|insn| insn.id == id)
    }

    pub fn get_mut(&mut self, id: InsnId) -> Option<&mut Instruction> {
        self.instructions.iter_mut().find(|insn| insn.id == id)
    }

    /// Removes the instruction with this identity, returning it if it was present.
    pub fn remove(&mut self, id: InsnId) -> Option<Instruction> {
        let position = self.position(id)?;
        Some(self.instructions.remove(position))
    }

    /// Inserts `instruction` directly before `anchor`. Returns false if `anchor` is not here.
    pub fn insert_before(&mut self, anchor: InsnId, instruction: Instruction) -> bool {
        match self.position(anchor) {
            Some(position) => {
                self.instructions.insert(position, instruction);
                true
            }
            None => false,
        }
    }

    /// Inserts `instruction` directly after `anchor`. Returns false if `anchor` is not here.
    pub fn insert_after(&mut self, anchor: InsnId, instruction: Instruction) -> bool {
        match self.position(anchor) {
            Some(position) => {
                self.instructions.insert(position + 1, instruction);
                true
            }
            None => false,
        }
    }

    /// Replaces the instruction `old` with `instruction`, keeping its position.
    pub fn replace(&mut self, old: InsnId, instruction: Instruction) -> Option<Instruction> {
        let position = self.position(old)?;
        Some(std::mem::replace(
            &mut self.instructions[position],
            instruction,
        ))
    }

    /// Moves every instruction of `other` to the end of this stream.
    pub fn append(&mut self, other: &mut InstructionStream) {
        self.instructions.append(&mut other.instructions);
    }

    /// Stream position of the label pseudo-instruction `label`.
    pub fn label_position(&self, label: LabelId) -> Option<usize> {
        self.instructions
            .iter()
            .position(|insn| insn.label() == Some(label))
    }

    /// Id of the label pseudo-instruction `label`.
    pub fn label_insn(&self, label: LabelId) -> Option<InsnId> {
        self.label_position(label)
            .map(|position| self.instructions[position].id)
    }

    /// Stream position of the previous instruction that is not a label.
    pub fn previous_real(&self, id: InsnId) -> Option<&Instruction> {
        let position = self.position(id)?;
        self.instructions[..position]
            .iter()
            .rev()
            .find(|insn| !insn.is_label())
    }

    /// First instruction at or after `label` that is not a label.
    pub fn real_at_label(&self, label: LabelId) -> Option<&Instruction> {
        let position = self.label_position(label)?;
        self.instructions[position..]
            .iter()
            .find(|insn| !insn.is_label())
    }

    pub fn retain(&mut self, keep: impl FnMut(&Instruction) -> bool) {
        self.instructions.retain(keep);
    }
}

impl<'a> IntoIterator for &'a InstructionStream {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstructionKind;
    use crate::opcodes;

    fn insn(id: u32, opcode: u8) -> Instruction {
        Instruction {
            id: InsnId(id),
            opcode,
            kind: InstructionKind::Simple,
        }
    }

    fn label(id: u32, label: u32) -> Instruction {
        Instruction {
            id: InsnId(id),
            opcode: opcodes::LABEL,
            kind: InstructionKind::Label(LabelId(label)),
        }
    }

    #[test]
    fn removal_and_insertion_are_by_identity() {
        let mut stream = InstructionStream::new();
        stream.push(insn(1, opcodes::ICONST_0));
        stream.push(insn(2, opcodes::ICONST_0));
        stream.push(insn(3, opcodes::RETURN));

        let removed = stream.remove(InsnId(2)).expect("present");
        assert_eq!(removed.id, InsnId(2));
        assert_eq!(stream.len(), 2);
        assert!(stream.remove(InsnId(2)).is_none());

        assert!(stream.insert_before(InsnId(3), insn(4, opcodes::POP)));
        assert!(stream.insert_after(InsnId(1), insn(5, opcodes::DUP)));
        let ids: Vec<u32> = stream.iter().map(|insn| insn.id.0).collect();
        assert_eq!(ids, vec![1, 5, 4, 3]);
        assert!(!stream.insert_after(InsnId(42), insn(6, opcodes::NOP)));
    }

    #[test]
    fn labels_resolve_to_following_real_instruction() {
        let mut stream = InstructionStream::new();
        stream.push(insn(1, opcodes::ICONST_0));
        stream.push(label(2, 7));
        stream.push(label(3, 8));
        stream.push(insn(4, opcodes::IRETURN));

        assert_eq!(stream.label_position(LabelId(8)), Some(2));
        assert_eq!(stream.label_insn(LabelId(7)), Some(InsnId(2)));
        assert_eq!(
            stream.real_at_label(LabelId(7)).map(|insn| insn.id),
            Some(InsnId(4))
        );
        assert_eq!(
            stream.previous_real(InsnId(4)).map(|insn| insn.id),
            Some(InsnId(1))
        );
    }
}
