//! Builders for small in-memory classes used throughout the unit tests.
//!
//! Classes are replayed through [`ClassVisitor`] exactly like decoded class files, so tests
//! exercise the same registration path. Named labels are allocated on first mention, which
//! lets jumps refer forward.

use std::collections::HashMap;

use crate::encode::{ClassEncoder, ClassWriter};
use crate::ir::{
    AccessFlags, CallKind, ClassId, Constant, FieldAccess, FieldInsn, InstructionKind, LabelId,
    LocalVariable, MethodInsn, Switch, TryCatch,
};
use crate::model::{ClassHeader, ClassVisitor, FieldDecl, MethodDecl, ModelBuilder};
use crate::opcodes;
use crate::program::Program;

pub(crate) struct ClassSpec {
    header: ClassHeader,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodSpec>,
}

impl ClassSpec {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            header: ClassHeader {
                name: name.to_string(),
                super_name: Some("java/lang/Object".to_string()),
                access: AccessFlags::PUBLIC | AccessFlags::SUPER,
                version: 50,
                ..ClassHeader::default()
            },
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn extends(mut self, name: &str) -> Self {
        self.header.super_name = Some(name.to_string());
        self
    }

    pub(crate) fn implements(mut self, name: &str) -> Self {
        self.header.interfaces.push(name.to_string());
        self
    }

    pub(crate) fn interface(mut self) -> Self {
        self.header.access = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        self
    }

    pub(crate) fn access(mut self, access: AccessFlags) -> Self {
        self.header.access = access;
        self
    }

    pub(crate) fn version(mut self, version: u16) -> Self {
        self.header.version = version;
        self
    }

    pub(crate) fn field(self, name: &str, descriptor: &str) -> Self {
        self.field_with(name, descriptor, AccessFlags::PRIVATE, None)
    }

    pub(crate) fn static_field(self, name: &str, descriptor: &str) -> Self {
        self.field_with(
            name,
            descriptor,
            AccessFlags::PRIVATE | AccessFlags::STATIC,
            None,
        )
    }

    /// `public static final` field with a ConstantValue.
    pub(crate) fn constant_field(self, name: &str, descriptor: &str, value: Constant) -> Self {
        self.field_with(
            name,
            descriptor,
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
            Some(value),
        )
    }

    pub(crate) fn field_with(
        mut self,
        name: &str,
        descriptor: &str,
        access: AccessFlags,
        value: Option<Constant>,
    ) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            value,
            ..FieldDecl::default()
        });
        self
    }

    pub(crate) fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    /// Registers the class in `program` and returns the id now bound to its name.
    pub(crate) fn load(self, program: &Program) -> ClassId {
        let name = self.header.name.clone();
        let mut builder = ModelBuilder::new(program);
        self.visit(&mut builder);
        program.find_class(&name).expect("class registered")
    }

    /// Class-file bytes for this class, as written by [`ClassWriter`].
    pub(crate) fn bytes(self) -> Vec<u8> {
        let program = Program::default();
        let class = self.load(&program);
        ClassWriter.encode(&program, class).expect("encode")
    }

    pub(crate) fn visit(self, visitor: &mut dyn ClassVisitor) {
        visitor.visit_class(self.header);
        for field in self.fields {
            visitor.visit_field(field);
        }
        for method in self.methods {
            method.visit(visitor);
        }
        visitor.visit_class_end();
    }
}

enum Item {
    Ready(u8, InstructionKind),
    Jump(u8, String),
    Switch(u8, String, Vec<(i32, String)>),
    Label(String),
}

pub(crate) struct MethodSpec {
    decl: MethodDecl,
    items: Vec<Item>,
    try_catch: Vec<(String, String, String, Option<String>)>,
    locals: Vec<(String, String, u16)>,
    max_stack: Option<u16>,
}

impl MethodSpec {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            decl: MethodDecl {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                access: AccessFlags::PUBLIC,
                ..MethodDecl::default()
            },
            items: Vec::new(),
            try_catch: Vec::new(),
            locals: Vec::new(),
            max_stack: None,
        }
    }

    pub(crate) fn statik(mut self) -> Self {
        self.decl.access |= AccessFlags::STATIC;
        self
    }

    /// Declares the method abstract; it should then get no instructions.
    pub(crate) fn abstract_(mut self) -> Self {
        self.decl.access |= AccessFlags::ABSTRACT;
        self
    }

    pub(crate) fn access(mut self, access: AccessFlags) -> Self {
        self.decl.access = access;
        self
    }

    pub(crate) fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    fn push(mut self, opcode: u8, kind: InstructionKind) -> Self {
        self.items.push(Item::Ready(opcode, kind));
        self
    }

    pub(crate) fn op(self, opcode: u8) -> Self {
        self.push(opcode, InstructionKind::Simple)
    }

    pub(crate) fn int(self, opcode: u8, value: i32) -> Self {
        self.push(opcode, InstructionKind::Int(value))
    }

    pub(crate) fn var(self, opcode: u8, index: u16) -> Self {
        self.push(opcode, InstructionKind::Var(index))
    }

    pub(crate) fn iinc(self, index: u16, delta: i16) -> Self {
        self.push(opcodes::IINC, InstructionKind::Iinc { index, delta })
    }

    pub(crate) fn ldc(self, constant: Constant) -> Self {
        let opcode = if constant.slots() == 2 {
            opcodes::LDC2_W
        } else {
            opcodes::LDC
        };
        self.push(opcode, InstructionKind::Constant(constant))
    }

    pub(crate) fn field(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        let access = if matches!(opcode, opcodes::GETFIELD | opcodes::GETSTATIC) {
            FieldAccess::Read
        } else {
            FieldAccess::Write
        };
        self.push(
            opcode,
            InstructionKind::Field(FieldInsn {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                access,
                is_static: matches!(opcode, opcodes::GETSTATIC | opcodes::PUTSTATIC),
            }),
        )
    }

    pub(crate) fn invoke(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        let kind = match opcode {
            opcodes::INVOKEINTERFACE => CallKind::Interface,
            opcodes::INVOKESPECIAL => CallKind::Special,
            opcodes::INVOKESTATIC => CallKind::Static,
            _ => CallKind::Virtual,
        };
        self.push(
            opcode,
            InstructionKind::Method(MethodInsn {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_interface: kind == CallKind::Interface,
                kind,
            }),
        )
    }

    pub(crate) fn type_insn(self, opcode: u8, class: &str) -> Self {
        self.push(opcode, InstructionKind::Type(class.to_string()))
    }

    pub(crate) fn label(mut self, name: &str) -> Self {
        self.items.push(Item::Label(name.to_string()));
        self
    }

    pub(crate) fn jump(mut self, opcode: u8, label: &str) -> Self {
        self.items.push(Item::Jump(opcode, label.to_string()));
        self
    }

    pub(crate) fn switch(mut self, opcode: u8, default: &str, cases: &[(i32, &str)]) -> Self {
        let cases = cases
            .iter()
            .map(|(key, label)| (*key, label.to_string()))
            .collect();
        self.items
            .push(Item::Switch(opcode, default.to_string(), cases));
        self
    }

    pub(crate) fn try_catch(
        mut self,
        start: &str,
        end: &str,
        handler: &str,
        catch_type: Option<&str>,
    ) -> Self {
        self.try_catch.push((
            start.to_string(),
            end.to_string(),
            handler.to_string(),
            catch_type.map(str::to_string),
        ));
        self
    }

    /// Named local spanning the whole body. Adds one label before and one after it.
    pub(crate) fn local(mut self, name: &str, descriptor: &str, index: u16) -> Self {
        self.locals
            .push((name.to_string(), descriptor.to_string(), index));
        self
    }

    fn visit(self, visitor: &mut dyn ClassVisitor) {
        let mut labels: HashMap<String, LabelId> = HashMap::new();
        visitor.visit_method(self.decl);

        let scope = if self.locals.is_empty() {
            None
        } else {
            let start = visitor.new_label();
            visitor.visit_instruction(opcodes::LABEL, InstructionKind::Label(start));
            Some(start)
        };

        for item in self.items {
            match item {
                Item::Ready(opcode, kind) => visitor.visit_instruction(opcode, kind),
                Item::Label(name) => {
                    let label = label_id(&mut labels, visitor, &name);
                    visitor.visit_instruction(opcodes::LABEL, InstructionKind::Label(label));
                }
                Item::Jump(opcode, name) => {
                    let label = label_id(&mut labels, visitor, &name);
                    visitor.visit_instruction(opcode, InstructionKind::Jump(label));
                }
                Item::Switch(opcode, default, cases) => {
                    let default = label_id(&mut labels, visitor, &default);
                    let cases = cases
                        .iter()
                        .map(|(key, name)| (*key, label_id(&mut labels, visitor, name)))
                        .collect();
                    visitor.visit_instruction(opcode, InstructionKind::Switch(Switch { default, cases }));
                }
            }
        }

        if let Some(start) = scope {
            let end = visitor.new_label();
            visitor.visit_instruction(opcodes::LABEL, InstructionKind::Label(end));
            for (name, descriptor, index) in self.locals {
                visitor.visit_local_variable(LocalVariable {
                    name,
                    descriptor,
                    signature: None,
                    start,
                    end,
                    index,
                    references: Default::default(),
                });
            }
        }

        for (start, end, handler, catch_type) in self.try_catch {
            let try_catch = TryCatch {
                start: label_id(&mut labels, visitor, &start),
                end: label_id(&mut labels, visitor, &end),
                handler: label_id(&mut labels, visitor, &handler),
                catch_type,
            };
            visitor.visit_try_catch(try_catch);
        }
        visitor.visit_method_end(self.max_stack, None);
    }
}

fn label_id(
    labels: &mut HashMap<String, LabelId>,
    visitor: &mut dyn ClassVisitor,
    name: &str,
) -> LabelId {
    if let Some(label) = labels.get(name) {
        return *label;
    }
    let label = visitor.new_label();
    labels.insert(name.to_string(), label);
    label
}
