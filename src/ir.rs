//! Entities of the program model: classes, fields, methods, instructions and control flow.
//!
//! Entities never point at each other directly. Every cross reference is an id that is looked
//! up through [`crate::program::Program`], so a renamed or deleted entity can never be reached
//! through a stale pointer.

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;

use crate::error::AnalyzerError;
use crate::stream::InstructionStream;

/// Stable id of a loaded class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

/// Stable id of a declared field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub(crate) u32);

/// Stable id of a declared method or constructor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

/// Stable id of one instruction, unique across the whole program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(pub(crate) u32);

/// Id of a label pseudo-instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub(crate) u32);

/// Index of a block inside its method's control flow graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{}", self.0)
    }
}

/// Back-reference to an instruction: the method whose stream holds it plus its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnRef {
    pub method: MethodId,
    pub insn: InsnId,
}

impl InsnRef {
    pub fn new(method: MethodId, insn: InsnId) -> Self {
        Self { method, insn }
    }

    /// The method the referencing instruction lives in.
    pub fn called_from(&self) -> MethodId {
        self.method
    }
}

bitflags! {
    /// JVM access flags shared by classes, fields and methods.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        /// `ACC_SUPER` on classes, `ACC_SYNCHRONIZED` on methods.
        const SUPER = 0x0020;
        /// `ACC_VOLATILE` on fields, `ACC_BRIDGE` on methods.
        const VOLATILE = 0x0040;
        /// `ACC_TRANSIENT` on fields, `ACC_VARARGS` on methods.
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

const VISIBILITY: AccessFlags = AccessFlags::PUBLIC
    .union(AccessFlags::PRIVATE)
    .union(AccessFlags::PROTECTED);

/// Access-flag tests and updates for anything that carries [`AccessFlags`].
pub trait Access {
    fn access(&self) -> AccessFlags;
    fn access_mut(&mut self) -> &mut AccessFlags;

    fn is_public(&self) -> bool {
        self.access().contains(AccessFlags::PUBLIC)
    }

    fn set_public(&mut self) {
        let access = self.access_mut();
        access.remove(VISIBILITY);
        access.insert(AccessFlags::PUBLIC);
    }

    fn is_private(&self) -> bool {
        self.access().contains(AccessFlags::PRIVATE)
    }

    fn set_private(&mut self) {
        let access = self.access_mut();
        access.remove(VISIBILITY);
        access.insert(AccessFlags::PRIVATE);
    }

    fn is_static(&self) -> bool {
        self.access().contains(AccessFlags::STATIC)
    }

    fn set_static(&mut self, value: bool) {
        self.access_mut().set(AccessFlags::STATIC, value);
    }

    fn is_abstract(&self) -> bool {
        self.access().contains(AccessFlags::ABSTRACT)
    }

    fn set_abstract(&mut self, value: bool) {
        self.access_mut().set(AccessFlags::ABSTRACT, value);
    }
}

/// Value stored in an annotation element.
#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl From<i64> for AnnotationValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for AnnotationValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for AnnotationValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Runtime-visible annotation attached to a class, field or method.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub descriptor: String,
    pub values: Vec<(String, AnnotationValue)>,
}

impl Annotation {
    /// Build an annotation for the internal class name `name`.
    pub fn named(name: &str, values: Vec<(String, AnnotationValue)>) -> Self {
        Self {
            descriptor: format!("L{name};"),
            values,
        }
    }

    pub fn value(&self, key: &str) -> Option<&AnnotationValue> {
        self.values
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

/// Loaded class and the ids of the members it owns.
#[derive(Clone, Debug)]
pub struct Class {
    pub(crate) id: ClassId,
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) signature: Option<String>,
    pub(crate) access: AccessFlags,
    pub(crate) version: u16,
    pub(crate) fields: Vec<FieldId>,
    pub(crate) methods: Vec<MethodId>,
    pub(crate) sub_classes: BTreeSet<ClassId>,
    pub(crate) implemented_by: BTreeSet<ClassId>,
    pub(crate) type_references: BTreeSet<InsnRef>,
    pub(crate) bootstrap_methods: Vec<BootstrapMethod>,
    pub annotations: Vec<Annotation>,
}

impl Class {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Internal name of the superclass, whether or not that class was scanned.
    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodId] {
        &self.methods
    }

    pub fn sub_classes(&self) -> &BTreeSet<ClassId> {
        &self.sub_classes
    }

    pub fn implemented_by(&self) -> &BTreeSet<ClassId> {
        &self.implemented_by
    }

    /// Type instructions anywhere in the program that name this class.
    pub fn type_references(&self) -> &BTreeSet<InsnRef> {
        &self.type_references
    }

    /// Bootstrap methods referenced by `invokedynamic` and dynamic constants of this class.
    pub fn bootstrap_methods(&self) -> &[BootstrapMethod] {
        &self.bootstrap_methods
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub fn is_enum(&self) -> bool {
        self.access.contains(AccessFlags::ENUM)
    }
}

impl Access for Class {
    fn access(&self) -> AccessFlags {
        self.access
    }

    fn access_mut(&mut self) -> &mut AccessFlags {
        &mut self.access
    }
}

/// Field declaration with the set of instructions that read or write it.
#[derive(Clone, Debug)]
pub struct Field {
    pub(crate) id: FieldId,
    pub(crate) owner: ClassId,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) signature: Option<String>,
    pub(crate) access: AccessFlags,
    pub value: Option<Constant>,
    pub(crate) references: BTreeSet<InsnRef>,
    pub annotations: Vec<Annotation>,
}

impl Field {
    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn owner(&self) -> ClassId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn references(&self) -> &BTreeSet<InsnRef> {
        &self.references
    }
}

impl Access for Field {
    fn access(&self) -> AccessFlags {
        self.access
    }

    fn access_mut(&mut self) -> &mut AccessFlags {
        &mut self.access
    }
}

/// Distinguishes ordinary methods from `<init>` and `<clinit>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Method,
    Constructor,
    StaticInitializer,
}

impl MethodKind {
    pub fn for_name(name: &str) -> Self {
        match name {
            "<init>" => Self::Constructor,
            "<clinit>" => Self::StaticInitializer,
            _ => Self::Method,
        }
    }
}

/// Method declaration, its decoded body and its control flow.
#[derive(Clone, Debug)]
pub struct Method {
    pub(crate) id: MethodId,
    pub(crate) owner: ClassId,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) signature: Option<String>,
    pub(crate) access: AccessFlags,
    pub(crate) kind: MethodKind,
    pub(crate) exceptions: Vec<String>,
    pub(crate) max_stack: Option<u16>,
    pub(crate) max_locals: Option<u16>,
    pub(crate) instructions: InstructionStream,
    pub(crate) try_catch: Vec<TryCatch>,
    pub(crate) local_variables: Vec<LocalVariable>,
    pub(crate) invocations: BTreeSet<InsnRef>,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) cfg_error: Option<AnalyzerError>,
    pub annotations: Vec<Annotation>,
}

impl Method {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn owner(&self) -> ClassId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_constructor(&self) -> bool {
        self.kind != MethodKind::Method
    }

    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    pub fn max_stack(&self) -> Option<u16> {
        self.max_stack
    }

    pub fn max_locals(&self) -> Option<u16> {
        self.max_locals
    }

    pub fn instructions(&self) -> &InstructionStream {
        &self.instructions
    }

    pub fn try_catch_blocks(&self) -> &[TryCatch] {
        &self.try_catch
    }

    pub fn local_variables(&self) -> &[LocalVariable] {
        &self.local_variables
    }

    /// Call instructions elsewhere in the program that invoke this method.
    pub fn invocations(&self) -> &BTreeSet<InsnRef> {
        &self.invocations
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    pub fn blocks(&self) -> &[Block] {
        &self.cfg.blocks
    }

    /// Why the last control flow analysis of this method failed, if it did.
    pub fn cfg_error(&self) -> Option<&AnalyzerError> {
        self.cfg_error.as_ref()
    }

    pub fn field_references(&self) -> impl Iterator<Item = (&Instruction, &FieldInsn)> {
        self.instructions.iter().filter_map(|insn| match &insn.kind {
            InstructionKind::Field(field) => Some((insn, field)),
            _ => None,
        })
    }

    pub fn field_reads(&self) -> impl Iterator<Item = (&Instruction, &FieldInsn)> {
        self.field_references()
            .filter(|(_, field)| field.access == FieldAccess::Read)
    }

    pub fn field_writes(&self) -> impl Iterator<Item = (&Instruction, &FieldInsn)> {
        self.field_references()
            .filter(|(_, field)| field.access == FieldAccess::Write)
    }

    pub fn method_calls(&self) -> impl Iterator<Item = (&Instruction, &MethodInsn)> {
        self.instructions.iter().filter_map(|insn| match &insn.kind {
            InstructionKind::Method(call) => Some((insn, call)),
            _ => None,
        })
    }

    /// Instructions that name a class: type instructions and `ldc` class constants.
    pub fn type_references(&self) -> impl Iterator<Item = (&Instruction, &str)> {
        self.instructions
            .iter()
            .filter_map(|insn| insn.referenced_class().map(|class| (insn, class)))
    }

    /// Block whose first instruction is `insn`.
    pub fn block_starting_with(&self, insn: InsnId) -> Option<&Block> {
        self.cfg.blocks.iter().find(|block| block.first() == Some(insn))
    }

    /// Block whose last instruction is `insn`.
    pub fn block_ending_with(&self, insn: InsnId) -> Option<&Block> {
        self.cfg.blocks.iter().find(|block| block.last() == Some(insn))
    }

    pub fn block_containing(&self, insn: InsnId) -> Option<&Block> {
        self.cfg
            .blocks
            .iter()
            .find(|block| block.instructions.contains(&insn))
    }

    /// Block that starts at the try region's start label.
    pub fn try_block(&self, try_catch: &TryCatch) -> Option<&Block> {
        let start = self.instructions.label_insn(try_catch.start)?;
        self.block_starting_with(start)
    }

    /// Block that starts at the handler label.
    pub fn catch_block(&self, try_catch: &TryCatch) -> Option<&Block> {
        let handler = self.instructions.label_insn(try_catch.handler)?;
        self.block_starting_with(handler)
    }
}

impl Access for Method {
    fn access(&self) -> AccessFlags {
        self.access
    }

    fn access_mut(&mut self) -> &mut AccessFlags {
        &mut self.access
    }
}

/// Exception handler record. All three positions are labels in the owning stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryCatch {
    pub start: LabelId,
    pub end: LabelId,
    pub handler: LabelId,
    /// `None` catches everything (`finally`).
    pub catch_type: Option<String>,
}

/// Named local variable from the LocalVariableTable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub start: LabelId,
    pub end: LabelId,
    pub index: u16,
    /// Load, store and `iinc` instructions touching this slot.
    pub references: BTreeSet<InsnId>,
}

/// Constant loaded by `ldc` or stored in a ConstantValue attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    /// Internal name or array descriptor of a class literal.
    Class(String),
    MethodType(String),
    MethodHandle {
        kind: u8,
        owner: String,
        name: String,
        descriptor: String,
        is_interface: bool,
    },
    /// `CONSTANT_Dynamic`; `bootstrap` indexes the owning class's bootstrap methods.
    Dynamic {
        name: String,
        descriptor: String,
        bootstrap: u16,
    },
}

/// Entry of a class's BootstrapMethods attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapMethod {
    /// Always a [`Constant::MethodHandle`].
    pub handle: Constant,
    pub arguments: Vec<Constant>,
}

impl Constant {
    /// Operand stack slots taken by the constant once loaded.
    pub fn slots(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            Constant::Dynamic { descriptor, .. } if descriptor == "J" || descriptor == "D" => 2,
            _ => 1,
        }
    }
}

/// Whether a field instruction reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldAccess {
    Read,
    Write,
}

/// `getfield`/`putfield`/`getstatic`/`putstatic` operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInsn {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub access: FieldAccess,
    pub is_static: bool,
}

impl FieldInsn {
    pub fn key(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// Invoke opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// `invoke*` operand (everything except `invokedynamic`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInsn {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub is_interface: bool,
    pub kind: CallKind,
}

impl MethodInsn {
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.owner, self.name, self.descriptor)
    }
}

/// `invokedynamic` operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicInsn {
    pub name: String,
    pub descriptor: String,
    pub bootstrap: u16,
}

/// `tableswitch`/`lookupswitch` operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Switch {
    pub default: LabelId,
    pub cases: Vec<(i32, LabelId)>,
}

impl Switch {
    pub fn targets(&self) -> impl Iterator<Item = LabelId> + '_ {
        std::iter::once(self.default).chain(self.cases.iter().map(|(_, label)| *label))
    }
}

/// Operand payload of an instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum InstructionKind {
    /// Position marker; targets of jumps, try/catch and local-variable ranges.
    Label(LabelId),
    /// Opcode with no operand.
    Simple,
    /// `bipush`/`sipush`.
    Int(i32),
    /// Local variable load/store and `ret`.
    Var(u16),
    Iinc { index: u16, delta: i16 },
    Constant(Constant),
    Jump(LabelId),
    Switch(Switch),
    Field(FieldInsn),
    Method(MethodInsn),
    InvokeDynamic(DynamicInsn),
    /// `new`/`anewarray`/`checkcast`/`instanceof` with the class name or array descriptor.
    Type(String),
    /// `newarray` with the primitive array type code.
    NewArray(u8),
    MultiANewArray { class: String, dimensions: u8 },
}

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub(crate) id: InsnId,
    pub opcode: u8,
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn id(&self) -> InsnId {
        self.id
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InstructionKind::Label(_))
    }

    pub fn label(&self) -> Option<LabelId> {
        match self.kind {
            InstructionKind::Label(label) => Some(label),
            _ => None,
        }
    }

    /// Class named by a type instruction or class literal.
    pub fn referenced_class(&self) -> Option<&str> {
        match &self.kind {
            InstructionKind::Type(class) => Some(class),
            InstructionKind::MultiANewArray { class, .. } => Some(class),
            InstructionKind::Constant(Constant::Class(class)) => Some(class),
            _ => None,
        }
    }

    /// Labels this instruction can transfer control to.
    pub fn jump_targets(&self) -> Vec<LabelId> {
        match &self.kind {
            InstructionKind::Jump(label) => vec![*label],
            InstructionKind::Switch(switch) => switch.targets().collect(),
            _ => Vec::new(),
        }
    }
}

/// Basic block: a maximal straight-line run of instructions of one method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<InsnId>,
}

impl Block {
    pub fn first(&self) -> Option<InsnId> {
        self.instructions.first().copied()
    }

    pub fn last(&self) -> Option<InsnId> {
        self.instructions.last().copied()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Edge between basic blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
    /// Instruction whose execution transfers control along this edge.
    pub source: InsnId,
}

/// Edge classification used for CFG inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EdgeKind {
    FallThrough,
    Branch,
    Exception,
}

/// Basic block graph for method bytecode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlFlowGraph {
    pub blocks: Vec<Block>,
    pub edges: Vec<FlowEdge>,
}

impl ControlFlowGraph {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    pub fn predecessors(&self, id: BlockId) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.to == id)
    }

    pub fn exception_edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges
            .iter()
            .filter(|edge| edge.kind == EdgeKind::Exception)
    }

    pub fn has_edge(&self, from: BlockId, to: BlockId, kind: EdgeKind) -> bool {
        self.edges
            .iter()
            .any(|edge| edge.from == from && edge.to == to && edge.kind == kind)
    }
}
