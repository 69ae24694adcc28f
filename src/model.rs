//! Decode-time model construction.
//!
//! A class decoder drives a [`ClassVisitor`] in stream order, one pass per class. The
//! [`ModelBuilder`] implementation registers each class, field and method in the program as soon
//! as its header is seen; instruction bodies are buffered and attached when the method ends.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::MutationError;
use crate::ir::{
    AccessFlags, Annotation, BootstrapMethod, Class, ClassId, Constant, ControlFlowGraph, Field,
    FieldId, InstructionKind, LabelId, LocalVariable, Method, MethodId, MethodKind, TryCatch,
};
use crate::opcodes;
use crate::program::Program;
use crate::stream::InstructionStream;

/// Class header as found at the start of a class file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassHeader {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub signature: Option<String>,
    pub access: AccessFlags,
    pub version: u16,
    pub annotations: Vec<Annotation>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub access: AccessFlags,
    pub value: Option<Constant>,
    pub annotations: Vec<Annotation>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MethodDecl {
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub access: AccessFlags,
    pub exceptions: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// Callbacks a class decoder invokes, in stream order.
///
/// Instructions, try/catch regions and local variables belong to the most recent
/// [`ClassVisitor::visit_method`]; [`ClassVisitor::visit_method_end`] closes the body.
pub trait ClassVisitor {
    /// Allocates a label that instructions and ranges of the current method can refer to.
    fn new_label(&mut self) -> LabelId;

    fn visit_class(&mut self, header: ClassHeader);

    fn visit_field(&mut self, field: FieldDecl);

    fn visit_method(&mut self, method: MethodDecl);

    /// Any instruction, including [`InstructionKind::Label`] position markers.
    fn visit_instruction(&mut self, opcode: u8, kind: InstructionKind);

    fn visit_try_catch(&mut self, try_catch: TryCatch);

    fn visit_local_variable(&mut self, variable: LocalVariable);

    fn visit_method_end(&mut self, max_stack: Option<u16>, max_locals: Option<u16>);

    fn visit_class_end(&mut self) {}
}

#[derive(Default)]
struct PendingBody {
    instructions: InstructionStream,
    try_catch: Vec<TryCatch>,
    local_variables: Vec<LocalVariable>,
}

/// Builds program entities from visitor callbacks.
pub struct ModelBuilder<'p> {
    program: &'p Program,
    class: Option<ClassId>,
    method: Option<MethodId>,
    body: PendingBody,
    created: Vec<ClassId>,
}

impl<'p> ModelBuilder<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            class: None,
            method: None,
            body: PendingBody::default(),
            created: Vec::new(),
        }
    }

    /// Classes registered through this builder, in visit order.
    pub fn classes(&self) -> &[ClassId] {
        &self.created
    }

    pub fn into_classes(self) -> Vec<ClassId> {
        self.created
    }

    fn flush_method(&mut self) {
        let Some(method) = self.method.take() else {
            return;
        };
        let mut body = std::mem::take(&mut self.body);
        collect_local_references(&body.instructions, &mut body.local_variables);
        self.program.update_method(method, |target| {
            target.instructions = body.instructions;
            target.try_catch = body.try_catch;
            target.local_variables = body.local_variables;
        });
    }
}

impl ClassVisitor for ModelBuilder<'_> {
    fn new_label(&mut self) -> LabelId {
        self.program.new_label().0
    }

    fn visit_class(&mut self, header: ClassHeader) {
        self.flush_method();
        let name = header.name.clone();
        let Some(id) = self.program.register_class(header) else {
            warn!(class = %name, "duplicate class definition ignored");
            self.class = None;
            return;
        };
        self.class = Some(id);
        self.created.push(id);
    }

    fn visit_field(&mut self, decl: FieldDecl) {
        let Some(owner) = self.class else {
            return;
        };
        let field = Field {
            id: self.program.next_field_id(),
            owner,
            name: decl.name,
            descriptor: decl.descriptor,
            signature: decl.signature,
            access: decl.access,
            value: decl.value,
            references: BTreeSet::new(),
            annotations: decl.annotations,
        };
        if let Err(error) = self.program.attach_field(owner, field) {
            warn!(%error, "field skipped");
        }
    }

    fn visit_method(&mut self, decl: MethodDecl) {
        self.flush_method();
        let Some(owner) = self.class else {
            return;
        };
        let method = Method {
            id: self.program.next_method_id(),
            owner,
            kind: MethodKind::for_name(&decl.name),
            name: decl.name,
            descriptor: decl.descriptor,
            signature: decl.signature,
            access: decl.access,
            exceptions: decl.exceptions,
            max_stack: None,
            max_locals: None,
            instructions: InstructionStream::new(),
            try_catch: Vec::new(),
            local_variables: Vec::new(),
            invocations: BTreeSet::new(),
            cfg: ControlFlowGraph::default(),
            cfg_error: None,
            annotations: decl.annotations,
        };
        match self.program.attach_method(owner, method) {
            Ok(id) => self.method = Some(id),
            Err(error) => warn!(%error, "method skipped"),
        }
    }

    fn visit_instruction(&mut self, opcode: u8, kind: InstructionKind) {
        if self.method.is_some() {
            let instruction = self.program.new_instruction(opcode, kind);
            self.body.instructions.push(instruction);
        }
    }

    fn visit_try_catch(&mut self, try_catch: TryCatch) {
        if self.method.is_some() {
            self.body.try_catch.push(try_catch);
        }
    }

    fn visit_local_variable(&mut self, variable: LocalVariable) {
        if self.method.is_some() {
            self.body.local_variables.push(variable);
        }
    }

    fn visit_method_end(&mut self, max_stack: Option<u16>, max_locals: Option<u16>) {
        if let Some(method) = self.method {
            self.program.update_method(method, |target| {
                target.max_stack = max_stack;
                target.max_locals = max_locals;
            });
        }
        self.flush_method();
    }

    fn visit_class_end(&mut self) {
        self.flush_method();
        self.class = None;
    }
}

/// Fills each local variable's reference set with the loads, stores and `iinc`s of its slot
/// inside its live range.
pub(crate) fn collect_local_references(
    instructions: &InstructionStream,
    variables: &mut [LocalVariable],
) {
    for variable in variables.iter_mut() {
        variable.references.clear();
        let (Some(start), Some(end)) = (
            instructions.label_position(variable.start),
            instructions.label_position(variable.end),
        ) else {
            continue;
        };
        for insn in &instructions.as_slice()[start..end.max(start)] {
            if local_slot(insn.opcode, &insn.kind) == Some(variable.index) {
                variable.references.insert(insn.id);
            }
        }
    }
}

/// Local variable slot touched by a load, store or `iinc`.
pub(crate) fn local_slot(opcode: u8, kind: &InstructionKind) -> Option<u16> {
    match kind {
        InstructionKind::Var(index) if opcode != opcodes::RET => Some(*index),
        InstructionKind::Iinc { index, .. } => Some(*index),
        InstructionKind::Simple if (opcodes::ILOAD_0..=opcodes::ALOAD_3).contains(&opcode) => {
            Some(((opcode - opcodes::ILOAD_0) % 4) as u16)
        }
        InstructionKind::Simple if (opcodes::ISTORE_0..=opcodes::ASTORE_3).contains(&opcode) => {
            Some(((opcode - opcodes::ISTORE_0) % 4) as u16)
        }
        _ => None,
    }
}

impl Program {
    /// Creates and indexes a class. Returns `None`, creating nothing, when the name is already
    /// registered.
    pub fn register_class(&self, header: ClassHeader) -> Option<ClassId> {
        let id = self.next_class_id();
        if !self.index().claim_class(&header.name, id) {
            return None;
        }
        let class = Class {
            id,
            name: header.name,
            super_name: header.super_name,
            interfaces: header.interfaces,
            signature: header.signature,
            access: header.access,
            version: header.version,
            fields: Vec::new(),
            methods: Vec::new(),
            sub_classes: BTreeSet::new(),
            implemented_by: BTreeSet::new(),
            type_references: BTreeSet::new(),
            bootstrap_methods: header.bootstrap_methods,
            annotations: header.annotations,
        };
        self.classes.insert(id, class);
        Some(id)
    }

    /// Registration path shared by decoding and [`crate::mutate`] moves: indexes `field` under
    /// `owner` and appends it to the owner's field list. The field keeps its id.
    pub(crate) fn attach_field(&self, owner: ClassId, mut field: Field) -> Result<FieldId, MutationError> {
        let owner_name = self
            .class_name(owner)
            .ok_or(MutationError::UnknownClass(owner))?;
        let key = crate::index::field_key(&owner_name, &field.name);
        if self.index().lookup_field(&key).is_some_and(|existing| existing != field.id) {
            return Err(MutationError::NameTaken(key));
        }
        let id = field.id;
        let name = field.name.clone();
        field.owner = owner;
        self.fields.insert(id, field);
        self.index().register_field(&owner_name, &name, id);
        self.update_class(owner, |class| class.fields.push(id));
        Ok(id)
    }

    /// Method counterpart of [`Program::attach_field`].
    pub(crate) fn attach_method(
        &self,
        owner: ClassId,
        mut method: Method,
    ) -> Result<MethodId, MutationError> {
        let owner_name = self
            .class_name(owner)
            .ok_or(MutationError::UnknownClass(owner))?;
        let key = crate::index::method_key(&owner_name, &method.name, &method.descriptor);
        if self.index().lookup_method(&key).is_some_and(|existing| existing != method.id) {
            return Err(MutationError::NameTaken(key));
        }
        let id = method.id;
        let (name, descriptor) = (method.name.clone(), method.descriptor.clone());
        method.owner = owner;
        self.methods.insert(id, method);
        self.index()
            .register_method(&owner_name, &name, &descriptor, id);
        self.update_class(owner, |class| class.methods.push(id));
        Ok(id)
    }
}
