//! Class-file encoder: writes a loaded class back out as bytes.
//!
//! The constant pool is rebuilt from scratch, so names changed by mutations land in the output
//! without any bookkeeping. Labels become byte offsets again; branches whose distance no longer
//! fits 16 bits are widened. No StackMapTable is produced, so classes are written with a class
//! file version that the JVM verifies by type inference unless they use features that need a
//! newer one.

use std::collections::HashMap;

use crate::analyzer::FlowAnalyzer;
use crate::bytecode::{Writer, encode_modified_utf8};
use crate::descriptor;
use crate::error::EncodeError;
use crate::ir::{
    Access, Annotation, AnnotationValue, BootstrapMethod, Class, ClassId, Constant, Field,
    Instruction, InstructionKind, LabelId, Method, Switch,
};
use crate::model::local_slot;
use crate::opcodes;
use crate::program::Program;

const MAGIC: u32 = 0xcafe_babe;
/// Newest class-file version that verifies without StackMapTable frames.
const INFERENCE_VERSION: u16 = 50;
const OLDEST_VERSION: u16 = 45;

/// Turns one loaded class into class-file bytes.
pub trait ClassEncoder: Send + Sync {
    fn encode(&self, program: &Program, class: ClassId) -> Result<Vec<u8>, EncodeError>;
}

/// The default [`ClassEncoder`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassWriter;

impl ClassEncoder for ClassWriter {
    fn encode(&self, program: &Program, id: ClassId) -> Result<Vec<u8>, EncodeError> {
        let class = program
            .class(id)
            .map(|class| class.clone())
            .ok_or(EncodeError::UnknownClass(id))?;
        let mut pool = PoolBuilder::default();
        let mut body = Writer::default();
        let mut modern = false;

        body.u16(class.access.bits());
        body.u16(pool.class(&class.name)?);
        body.u16(match &class.super_name {
            Some(name) => pool.class(name)?,
            None => 0,
        });
        body.u16(class.interfaces.len() as u16);
        for interface in &class.interfaces {
            body.u16(pool.class(interface)?);
        }

        let fields: Vec<Field> = class
            .fields
            .iter()
            .filter_map(|field| program.field(*field).map(|field| field.clone()))
            .collect();
        body.u16(fields.len() as u16);
        for field in &fields {
            write_field(&mut body, &mut pool, field)?;
        }

        let methods: Vec<Method> = class
            .methods
            .iter()
            .filter_map(|method| program.method(*method).map(|method| method.clone()))
            .collect();
        body.u16(methods.len() as u16);
        for method in &methods {
            let qualified = format!("{}.{}{}", class.name, method.name, method.descriptor);
            modern |= method
                .instructions
                .iter()
                .any(|insn| needs_modern_version(&insn.kind));
            modern |= class.is_interface()
                && !method.is_abstract()
                && method.name != "<clinit>";
            write_method(&mut body, &mut pool, method, &qualified)?;
        }

        write_class_attributes(&mut body, &mut pool, &class)?;

        let mut out = Writer::default();
        out.u32(MAGIC);
        out.u16(0);
        out.u16(class_version(&class, modern));
        pool.write(&mut out);
        out.bytes(&body.into_bytes());
        Ok(out.into_bytes())
    }
}

/// Whether an instruction only exists in class files newer than [`INFERENCE_VERSION`].
pub fn needs_modern_version(kind: &InstructionKind) -> bool {
    matches!(
        kind,
        InstructionKind::InvokeDynamic(_)
            | InstructionKind::Constant(
                Constant::MethodHandle { .. } | Constant::MethodType(_) | Constant::Dynamic { .. }
            )
    )
}

fn class_version(class: &Class, modern: bool) -> u16 {
    if modern {
        class.version.max(INFERENCE_VERSION + 1)
    } else {
        class.version.clamp(OLDEST_VERSION, INFERENCE_VERSION)
    }
}

fn write_field(out: &mut Writer, pool: &mut PoolBuilder, field: &Field) -> Result<(), EncodeError> {
    out.u16(field.access.bits());
    out.u16(pool.utf8(&field.name)?);
    out.u16(pool.utf8(&field.descriptor)?);

    let mut attributes = Attributes::default();
    if let Some(value) = &field.value {
        let mut body = Writer::default();
        body.u16(pool.constant(value)?);
        attributes.push(pool, "ConstantValue", body)?;
    }
    if let Some(signature) = &field.signature {
        attributes.push_signature(pool, signature)?;
    }
    attributes.push_annotations(pool, &field.annotations)?;
    attributes.write(out);
    Ok(())
}

fn write_method(
    out: &mut Writer,
    pool: &mut PoolBuilder,
    method: &Method,
    qualified: &str,
) -> Result<(), EncodeError> {
    out.u16(method.access.bits());
    out.u16(pool.utf8(&method.name)?);
    out.u16(pool.utf8(&method.descriptor)?);

    let mut attributes = Attributes::default();
    if !method.instructions.is_empty() {
        let code = write_code(pool, method, qualified)?;
        attributes.push(pool, "Code", code)?;
    }
    if !method.exceptions.is_empty() {
        let mut body = Writer::default();
        body.u16(method.exceptions.len() as u16);
        for exception in &method.exceptions {
            body.u16(pool.class(exception)?);
        }
        attributes.push(pool, "Exceptions", body)?;
    }
    if let Some(signature) = &method.signature {
        attributes.push_signature(pool, signature)?;
    }
    attributes.push_annotations(pool, &method.annotations)?;
    attributes.write(out);
    Ok(())
}

fn write_class_attributes(
    out: &mut Writer,
    pool: &mut PoolBuilder,
    class: &Class,
) -> Result<(), EncodeError> {
    let mut attributes = Attributes::default();
    if let Some(signature) = &class.signature {
        attributes.push_signature(pool, signature)?;
    }
    attributes.push_annotations(pool, &class.annotations)?;
    if !class.bootstrap_methods.is_empty() {
        let body = write_bootstrap_methods(pool, &class.bootstrap_methods)?;
        attributes.push(pool, "BootstrapMethods", body)?;
    }
    attributes.write(out);
    Ok(())
}

fn write_bootstrap_methods(
    pool: &mut PoolBuilder,
    methods: &[BootstrapMethod],
) -> Result<Writer, EncodeError> {
    let mut body = Writer::default();
    body.u16(methods.len() as u16);
    for method in methods {
        body.u16(pool.constant(&method.handle)?);
        body.u16(method.arguments.len() as u16);
        for argument in &method.arguments {
            body.u16(pool.constant(argument)?);
        }
    }
    Ok(body)
}

fn write_code(pool: &mut PoolBuilder, method: &Method, qualified: &str) -> Result<Writer, EncodeError> {
    let instructions = method.instructions.as_slice();
    let assembler = Assembler::new(pool, instructions, qualified)?;
    let offsets = assembler.layout()?;
    let code = assembler.emit(&offsets)?;
    let label_offset = |label: LabelId| -> Result<u16, EncodeError> {
        let offset = assembler
            .labels
            .get(&label)
            .map(|position| offsets.at[*position])
            .ok_or_else(|| assembler.unknown(label))?;
        Ok(offset as u16)
    };

    let mut body = Writer::default();
    body.u16(max_stack(method));
    body.u16(max_locals(method));
    body.u32(code.len() as u32);
    body.bytes(&code.into_bytes());

    let mut handlers = Vec::with_capacity(method.try_catch.len());
    for try_catch in &method.try_catch {
        let start = label_offset(try_catch.start)?;
        let end = label_offset(try_catch.end)?;
        if start >= end {
            continue;
        }
        let catch_type = match &try_catch.catch_type {
            Some(class) => pool.class(class)?,
            None => 0,
        };
        handlers.push([start, end, label_offset(try_catch.handler)?, catch_type]);
    }
    body.u16(handlers.len() as u16);
    for handler in handlers {
        for value in handler {
            body.u16(value);
        }
    }

    let mut attributes = Attributes::default();
    if !method.local_variables.is_empty() {
        let mut table = Writer::default();
        let mut types = Writer::default();
        let mut typed = 0u16;
        table.u16(method.local_variables.len() as u16);
        for variable in &method.local_variables {
            let start = label_offset(variable.start)?;
            let length = label_offset(variable.end)?.saturating_sub(start);
            table.u16(start);
            table.u16(length);
            table.u16(pool.utf8(&variable.name)?);
            table.u16(pool.utf8(&variable.descriptor)?);
            table.u16(variable.index);
            if let Some(signature) = &variable.signature {
                typed += 1;
                types.u16(start);
                types.u16(length);
                types.u16(pool.utf8(&variable.name)?);
                types.u16(pool.utf8(signature)?);
                types.u16(variable.index);
            }
        }
        attributes.push(pool, "LocalVariableTable", table)?;
        if typed > 0 {
            let mut body = Writer::default();
            body.u16(typed);
            body.bytes(&types.into_bytes());
            attributes.push(pool, "LocalVariableTypeTable", body)?;
        }
    }
    attributes.write(&mut body);
    Ok(body)
}

/// Recomputed from the body when the analysis succeeds, since mutations may have changed it.
fn max_stack(method: &Method) -> u16 {
    let analyzer = FlowAnalyzer::with_parts(&method.instructions, &method.try_catch, None);
    match analyzer.analyze(&mut ()) {
        Ok(frames) => frames.max_height().min(u16::MAX as usize) as u16,
        Err(_) => method.max_stack.unwrap_or(u16::MAX),
    }
}

fn max_locals(method: &Method) -> u16 {
    let mut needed = descriptor::method_slots(&method.descriptor)
        .map(|(arguments, _)| arguments)
        .unwrap_or(0)
        + usize::from(!method.is_static());
    for insn in &method.instructions {
        if let Some(slot) = local_slot(insn.opcode, &insn.kind) {
            let width = if is_wide_local(insn.opcode) { 2 } else { 1 };
            needed = needed.max(slot as usize + width);
        }
    }
    for variable in &method.local_variables {
        let width = descriptor::field_slots(&variable.descriptor).max(1);
        needed = needed.max(variable.index as usize + width);
    }
    let stored = method.max_locals.unwrap_or(0) as usize;
    needed.max(stored).min(u16::MAX as usize) as u16
}

fn is_wide_local(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::LLOAD
            | opcodes::DLOAD
            | opcodes::LSTORE
            | opcodes::DSTORE
            | opcodes::LLOAD_0..=opcodes::LLOAD_3
            | opcodes::DLOAD_0..=opcodes::DLOAD_3
            | opcodes::LSTORE_0..=opcodes::LSTORE_3
            | opcodes::DSTORE_0..=opcodes::DSTORE_3
    )
}

/// Opcode with the opposite condition, used to hop over a widened `goto_w`.
fn inverted(opcode: u8) -> u8 {
    match opcode {
        opcodes::IFNULL => opcodes::IFNONNULL,
        opcodes::IFNONNULL => opcodes::IFNULL,
        _ if (opcode - opcodes::IFEQ) % 2 == 0 => opcode + 1,
        _ => opcode - 1,
    }
}

/// Byte offset of every instruction; `at[len]` is the code length.
struct Offsets {
    at: Vec<u32>,
    far: Vec<bool>,
}

struct Assembler<'a> {
    instructions: &'a [Instruction],
    /// Constant pool index of each instruction's operand, 0 when it has none.
    operands: Vec<u16>,
    labels: HashMap<LabelId, usize>,
    method: &'a str,
}

impl<'a> Assembler<'a> {
    fn new(
        pool: &mut PoolBuilder,
        instructions: &'a [Instruction],
        method: &'a str,
    ) -> Result<Self, EncodeError> {
        let mut operands = Vec::with_capacity(instructions.len());
        let mut labels = HashMap::new();
        for (position, insn) in instructions.iter().enumerate() {
            let operand = match &insn.kind {
                InstructionKind::Label(label) => {
                    labels.insert(*label, position);
                    0
                }
                InstructionKind::Constant(constant) => pool.constant(constant)?,
                InstructionKind::Field(field) => {
                    pool.field_ref(&field.owner, &field.name, &field.descriptor)?
                }
                InstructionKind::Method(call) => pool.method_ref(
                    &call.owner,
                    &call.name,
                    &call.descriptor,
                    call.is_interface,
                )?,
                InstructionKind::InvokeDynamic(dynamic) => {
                    pool.invoke_dynamic(dynamic.bootstrap, &dynamic.name, &dynamic.descriptor)?
                }
                InstructionKind::Type(class) | InstructionKind::MultiANewArray { class, .. } => {
                    pool.class(class)?
                }
                _ => 0,
            };
            operands.push(operand);
        }
        Ok(Self {
            instructions,
            operands,
            labels,
            method,
        })
    }

    fn unknown(&self, label: LabelId) -> EncodeError {
        EncodeError::UnknownLabel {
            method: self.method.to_string(),
            label,
        }
    }

    fn target(&self, offsets: &[u32], label: LabelId) -> Result<i64, EncodeError> {
        self.labels
            .get(&label)
            .map(|position| offsets[*position] as i64)
            .ok_or_else(|| self.unknown(label))
    }

    /// Assigns offsets, widening short branches until every distance fits.
    fn layout(&self) -> Result<Offsets, EncodeError> {
        let mut far = vec![false; self.instructions.len()];
        loop {
            let mut at = Vec::with_capacity(self.instructions.len() + 1);
            let mut offset = 0u32;
            for (position, insn) in self.instructions.iter().enumerate() {
                at.push(offset);
                offset += self.size(position, insn, offset, far[position]);
            }
            at.push(offset);
            if offset > u16::MAX as u32 {
                return Err(EncodeError::CodeTooLarge {
                    method: self.method.to_string(),
                });
            }

            let mut widened = false;
            for (position, insn) in self.instructions.iter().enumerate() {
                let InstructionKind::Jump(label) = insn.kind else {
                    continue;
                };
                if far[position] || matches!(insn.opcode, opcodes::GOTO_W | opcodes::JSR_W) {
                    continue;
                }
                let distance = self.target(&at, label)? - at[position] as i64;
                if i16::try_from(distance).is_err() {
                    far[position] = true;
                    widened = true;
                }
            }
            if !widened {
                return Ok(Offsets { at, far });
            }
        }
    }

    fn size(&self, position: usize, insn: &Instruction, offset: u32, far: bool) -> u32 {
        match &insn.kind {
            InstructionKind::Label(_) => 0,
            InstructionKind::Simple => 1,
            InstructionKind::Int(_) if insn.opcode == opcodes::SIPUSH => 3,
            InstructionKind::Int(_) => 2,
            InstructionKind::Var(index) if *index > u8::MAX as u16 => 4,
            InstructionKind::Var(_) => 2,
            InstructionKind::Iinc { index, delta } => {
                if *index > u8::MAX as u16 || i8::try_from(*delta).is_err() {
                    6
                } else {
                    3
                }
            }
            InstructionKind::Constant(constant) => {
                if constant.slots() == 2 || self.operands[position] > u8::MAX as u16 {
                    3
                } else {
                    2
                }
            }
            InstructionKind::Jump(_) => match insn.opcode {
                opcodes::GOTO_W | opcodes::JSR_W => 5,
                _ if !far => 3,
                opcodes::GOTO | opcodes::JSR => 5,
                _ => 8,
            },
            InstructionKind::Switch(switch) => {
                let padding = (4 - (offset + 1) % 4) % 4;
                let table = if insn.opcode == opcodes::TABLESWITCH {
                    12 + 4 * table_span(switch) as u32
                } else {
                    8 + 8 * switch.cases.len() as u32
                };
                1 + padding + table
            }
            InstructionKind::Method(_) if insn.opcode == opcodes::INVOKEINTERFACE => 5,
            InstructionKind::Field(_) | InstructionKind::Method(_) | InstructionKind::Type(_) => 3,
            InstructionKind::InvokeDynamic(_) => 5,
            InstructionKind::NewArray(_) => 2,
            InstructionKind::MultiANewArray { .. } => 4,
        }
    }

    fn emit(&self, offsets: &Offsets) -> Result<Writer, EncodeError> {
        let mut out = Writer::default();
        for (position, insn) in self.instructions.iter().enumerate() {
            let offset = offsets.at[position];
            let operand = self.operands[position];
            match &insn.kind {
                InstructionKind::Label(_) => {}
                InstructionKind::Simple => out.u8(insn.opcode),
                InstructionKind::Int(value) => {
                    out.u8(insn.opcode);
                    if insn.opcode == opcodes::SIPUSH {
                        out.i16(*value as i16);
                    } else {
                        out.i8(*value as i8);
                    }
                }
                InstructionKind::Var(index) => {
                    if *index > u8::MAX as u16 {
                        out.u8(opcodes::WIDE);
                        out.u8(insn.opcode);
                        out.u16(*index);
                    } else {
                        out.u8(insn.opcode);
                        out.u8(*index as u8);
                    }
                }
                InstructionKind::Iinc { index, delta } => {
                    match (u8::try_from(*index), i8::try_from(*delta)) {
                        (Ok(index), Ok(delta)) => {
                            out.u8(opcodes::IINC);
                            out.u8(index);
                            out.i8(delta);
                        }
                        _ => {
                            out.u8(opcodes::WIDE);
                            out.u8(opcodes::IINC);
                            out.u16(*index);
                            out.i16(*delta);
                        }
                    }
                }
                InstructionKind::Constant(constant) => {
                    if constant.slots() == 2 {
                        out.u8(opcodes::LDC2_W);
                        out.u16(operand);
                    } else if operand > u8::MAX as u16 {
                        out.u8(opcodes::LDC_W);
                        out.u16(operand);
                    } else {
                        out.u8(opcodes::LDC);
                        out.u8(operand as u8);
                    }
                }
                InstructionKind::Jump(label) => {
                    let distance = self.target(&offsets.at, *label)? - offset as i64;
                    match insn.opcode {
                        opcodes::GOTO_W | opcodes::JSR_W => {
                            out.u8(insn.opcode);
                            out.i32(distance as i32);
                        }
                        _ if !offsets.far[position] => {
                            out.u8(insn.opcode);
                            out.i16(distance as i16);
                        }
                        opcodes::GOTO => {
                            out.u8(opcodes::GOTO_W);
                            out.i32(distance as i32);
                        }
                        opcodes::JSR => {
                            out.u8(opcodes::JSR_W);
                            out.i32(distance as i32);
                        }
                        _ => {
                            out.u8(inverted(insn.opcode));
                            out.i16(8);
                            out.u8(opcodes::GOTO_W);
                            out.i32((distance - 3) as i32);
                        }
                    }
                }
                InstructionKind::Switch(switch) => {
                    out.u8(insn.opcode);
                    for _ in 0..(4 - (offset + 1) % 4) % 4 {
                        out.u8(0);
                    }
                    let relative = |label: LabelId| -> Result<i32, EncodeError> {
                        Ok((self.target(&offsets.at, label)? - offset as i64) as i32)
                    };
                    out.i32(relative(switch.default)?);
                    if insn.opcode == opcodes::TABLESWITCH {
                        let (low, high) = table_bounds(switch);
                        out.i32(low);
                        out.i32(high);
                        for key in low..=high {
                            let label = switch
                                .cases
                                .iter()
                                .find(|(case, _)| *case == key)
                                .map_or(switch.default, |(_, label)| *label);
                            out.i32(relative(label)?);
                        }
                    } else {
                        let mut cases = switch.cases.clone();
                        cases.sort_by_key(|(key, _)| *key);
                        out.i32(cases.len() as i32);
                        for (key, label) in cases {
                            out.i32(key);
                            out.i32(relative(label)?);
                        }
                    }
                }
                InstructionKind::Field(_) | InstructionKind::Type(_) => {
                    out.u8(insn.opcode);
                    out.u16(operand);
                }
                InstructionKind::Method(call) => {
                    out.u8(insn.opcode);
                    out.u16(operand);
                    if insn.opcode == opcodes::INVOKEINTERFACE {
                        let arguments = descriptor::method_slots(&call.descriptor)
                            .map(|(arguments, _)| arguments)
                            .unwrap_or(0);
                        out.u8((arguments + 1).min(u8::MAX as usize) as u8);
                        out.u8(0);
                    }
                }
                InstructionKind::InvokeDynamic(_) => {
                    out.u8(insn.opcode);
                    out.u16(operand);
                    out.u16(0);
                }
                InstructionKind::NewArray(code) => {
                    out.u8(insn.opcode);
                    out.u8(*code);
                }
                InstructionKind::MultiANewArray { dimensions, .. } => {
                    out.u8(insn.opcode);
                    out.u16(operand);
                    out.u8(*dimensions);
                }
            }
        }
        Ok(out)
    }
}

/// Smallest and largest key of a table switch; `(0, -1)` when it has no cases.
fn table_bounds(switch: &Switch) -> (i32, i32) {
    let low = switch.cases.iter().map(|(key, _)| *key).min();
    let high = switch.cases.iter().map(|(key, _)| *key).max();
    match (low, high) {
        (Some(low), Some(high)) => (low, high),
        _ => (0, -1),
    }
}

fn table_span(switch: &Switch) -> i64 {
    let (low, high) = table_bounds(switch);
    (high as i64 - low as i64 + 1).max(0)
}

/// Attributes of one class, field, method or Code attribute, collected before writing.
#[derive(Default)]
struct Attributes {
    entries: Vec<(u16, Vec<u8>)>,
}

impl Attributes {
    fn push(&mut self, pool: &mut PoolBuilder, name: &str, body: Writer) -> Result<(), EncodeError> {
        self.entries.push((pool.utf8(name)?, body.into_bytes()));
        Ok(())
    }

    fn push_signature(&mut self, pool: &mut PoolBuilder, signature: &str) -> Result<(), EncodeError> {
        let mut body = Writer::default();
        body.u16(pool.utf8(signature)?);
        self.push(pool, "Signature", body)
    }

    fn push_annotations(
        &mut self,
        pool: &mut PoolBuilder,
        annotations: &[Annotation],
    ) -> Result<(), EncodeError> {
        if annotations.is_empty() {
            return Ok(());
        }
        let mut body = Writer::default();
        body.u16(annotations.len() as u16);
        for annotation in annotations {
            body.u16(pool.utf8(&annotation.descriptor)?);
            body.u16(annotation.values.len() as u16);
            for (name, value) in &annotation.values {
                body.u16(pool.utf8(name)?);
                match value {
                    AnnotationValue::Int(value) => match i32::try_from(*value) {
                        Ok(value) => {
                            body.u8(b'I');
                            body.u16(pool.constant(&Constant::Int(value))?);
                        }
                        Err(_) => {
                            body.u8(b'J');
                            body.u16(pool.constant(&Constant::Long(*value))?);
                        }
                    },
                    AnnotationValue::Bool(value) => {
                        body.u8(b'Z');
                        body.u16(pool.constant(&Constant::Int(i32::from(*value)))?);
                    }
                    AnnotationValue::Str(value) => {
                        body.u8(b's');
                        body.u16(pool.utf8(value)?);
                    }
                }
            }
        }
        self.push(pool, "RuntimeVisibleAnnotations", body)
    }

    fn write(self, out: &mut Writer) {
        out.u16(self.entries.len() as u16);
        for (name, body) in self.entries {
            out.u16(name);
            out.u32(body.len() as u32);
            out.bytes(&body);
        }
    }
}

/// Constant pool entry as written, with operands already turned into indices.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Entry {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
}

/// Deduplicating constant pool under construction.
struct PoolBuilder {
    entries: Vec<Entry>,
    indices: HashMap<Entry, u16>,
    next: u32,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            indices: HashMap::new(),
            next: 1,
        }
    }
}

impl PoolBuilder {
    fn add(&mut self, entry: Entry) -> Result<u16, EncodeError> {
        if let Some(index) = self.indices.get(&entry) {
            return Ok(*index);
        }
        let width = if matches!(entry, Entry::Long(_) | Entry::Double(_)) {
            2
        } else {
            1
        };
        if self.next + width > u16::MAX as u32 {
            return Err(EncodeError::PoolOverflow);
        }
        let index = self.next as u16;
        self.next += width;
        self.indices.insert(entry.clone(), index);
        self.entries.push(entry);
        Ok(index)
    }

    fn utf8(&mut self, text: &str) -> Result<u16, EncodeError> {
        let bytes = encode_modified_utf8(text);
        if bytes.len() > u16::MAX as usize {
            return Err(EncodeError::StringTooLong(bytes.len()));
        }
        self.add(Entry::Utf8(bytes))
    }

    fn class(&mut self, name: &str) -> Result<u16, EncodeError> {
        let name = self.utf8(name)?;
        self.add(Entry::Class(name))
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, EncodeError> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.add(Entry::NameAndType(name, descriptor))
    }

    fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, EncodeError> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        self.add(Entry::FieldRef(class, name_and_type))
    }

    fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16, EncodeError> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        if is_interface {
            self.add(Entry::InterfaceMethodRef(class, name_and_type))
        } else {
            self.add(Entry::MethodRef(class, name_and_type))
        }
    }

    fn invoke_dynamic(
        &mut self,
        bootstrap: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, EncodeError> {
        let name_and_type = self.name_and_type(name, descriptor)?;
        self.add(Entry::InvokeDynamic(bootstrap, name_and_type))
    }

    /// Loadable constant, as referenced by `ldc*`, ConstantValue and bootstrap arguments.
    fn constant(&mut self, constant: &Constant) -> Result<u16, EncodeError> {
        match constant {
            Constant::Int(value) => self.add(Entry::Integer(*value)),
            Constant::Float(value) => self.add(Entry::Float(value.to_bits())),
            Constant::Long(value) => self.add(Entry::Long(*value)),
            Constant::Double(value) => self.add(Entry::Double(value.to_bits())),
            Constant::String(value) => {
                let value = self.utf8(value)?;
                self.add(Entry::String(value))
            }
            Constant::Class(name) => self.class(name),
            Constant::MethodType(descriptor) => {
                let descriptor = self.utf8(descriptor)?;
                self.add(Entry::MethodType(descriptor))
            }
            Constant::MethodHandle {
                kind,
                owner,
                name,
                descriptor,
                is_interface,
            } => {
                // Kinds 1-4 are field accessors, the rest invoke methods.
                let reference = if *kind <= 4 {
                    self.field_ref(owner, name, descriptor)?
                } else {
                    self.method_ref(owner, name, descriptor, *is_interface)?
                };
                self.add(Entry::MethodHandle(*kind, reference))
            }
            Constant::Dynamic {
                name,
                descriptor,
                bootstrap,
            } => {
                let name_and_type = self.name_and_type(name, descriptor)?;
                self.add(Entry::Dynamic(*bootstrap, name_and_type))
            }
        }
    }

    fn write(&self, out: &mut Writer) {
        out.u16(self.next as u16);
        for entry in &self.entries {
            match entry {
                Entry::Utf8(bytes) => {
                    out.u8(1);
                    out.u16(bytes.len() as u16);
                    out.bytes(bytes);
                }
                Entry::Integer(value) => {
                    out.u8(3);
                    out.i32(*value);
                }
                Entry::Float(bits) => {
                    out.u8(4);
                    out.u32(*bits);
                }
                Entry::Long(value) => {
                    out.u8(5);
                    out.u64(*value as u64);
                }
                Entry::Double(bits) => {
                    out.u8(6);
                    out.u64(*bits);
                }
                Entry::Class(name) => {
                    out.u8(7);
                    out.u16(*name);
                }
                Entry::String(value) => {
                    out.u8(8);
                    out.u16(*value);
                }
                Entry::FieldRef(class, name_and_type) => {
                    out.u8(9);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                Entry::MethodRef(class, name_and_type) => {
                    out.u8(10);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                Entry::InterfaceMethodRef(class, name_and_type) => {
                    out.u8(11);
                    out.u16(*class);
                    out.u16(*name_and_type);
                }
                Entry::NameAndType(name, descriptor) => {
                    out.u8(12);
                    out.u16(*name);
                    out.u16(*descriptor);
                }
                Entry::MethodHandle(kind, reference) => {
                    out.u8(15);
                    out.u8(*kind);
                    out.u16(*reference);
                }
                Entry::MethodType(descriptor) => {
                    out.u8(16);
                    out.u16(*descriptor);
                }
                Entry::Dynamic(bootstrap, name_and_type) => {
                    out.u8(17);
                    out.u16(*bootstrap);
                    out.u16(*name_and_type);
                }
                Entry::InvokeDynamic(bootstrap, name_and_type) => {
                    out.u8(18);
                    out.u16(*bootstrap);
                    out.u16(*name_and_type);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_class;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::model::ModelBuilder;

    fn reload(bytes: &[u8]) -> (Program, ClassId) {
        let program = Program::default();
        let mut builder = ModelBuilder::new(&program);
        decode_class(bytes, &mut builder, false).expect("decode");
        let class = builder.into_classes()[0];
        (program, class)
    }

    fn opcodes_of(program: &Program, class: ClassId, name: &str) -> Vec<u8> {
        let method = program.method_by_name(class, name).expect("method");
        let method = program.method(method).expect("method");
        method
            .instructions()
            .iter()
            .filter(|insn| !insn.is_label())
            .map(|insn| insn.opcode)
            .collect()
    }

    #[test]
    fn written_classes_decode_to_the_same_model() {
        let bytes = ClassSpec::new("demo/Widget")
            .implements("java/lang/Runnable")
            .constant_field("SIZE", "I", Constant::Int(7))
            .method(
                MethodSpec::new("run", "()V")
                    .label("start")
                    .var(opcodes::ALOAD, 0)
                    .invoke(opcodes::INVOKEVIRTUAL, "demo/Widget", "size", "()I")
                    .op(opcodes::POP)
                    .label("end")
                    .op(opcodes::RETURN)
                    .label("handler")
                    .op(opcodes::ATHROW)
                    .try_catch("start", "end", "handler", Some("java/lang/Exception")),
            )
            .method(
                MethodSpec::new("size", "()I")
                    .local("n", "I", 1)
                    .ldc(Constant::String("caf\u{e9}\0".to_string()))
                    .op(opcodes::POP)
                    .int(opcodes::SIPUSH, 1000)
                    .var(opcodes::ISTORE, 1)
                    .var(opcodes::ILOAD, 1)
                    .op(opcodes::IRETURN),
            )
            .bytes();

        let (program, class) = reload(&bytes);
        let widget = program.class(class).expect("class");
        assert_eq!(widget.name(), "demo/Widget");
        assert_eq!(widget.interfaces(), &["java/lang/Runnable".to_string()]);
        assert_eq!(widget.version(), INFERENCE_VERSION);
        drop(widget);

        let size = program.find_field("demo/Widget", "SIZE").expect("field");
        assert_eq!(program.field(size).expect("field").value, Some(Constant::Int(7)));

        assert_eq!(
            opcodes_of(&program, class, "run"),
            vec![
                opcodes::ALOAD,
                opcodes::INVOKEVIRTUAL,
                opcodes::POP,
                opcodes::RETURN,
                opcodes::ATHROW
            ]
        );
        let run = program.method_by_name(class, "run").expect("run");
        let run = program.method(run).expect("run");
        assert_eq!(run.try_catch_blocks().len(), 1);
        assert_eq!(run.max_stack(), Some(1));
        drop(run);

        let size = program.method_by_name(class, "size").expect("size");
        let size = program.method(size).expect("size");
        assert_eq!(size.local_variables()[0].name, "n");
        assert_eq!(size.max_locals(), Some(2));
        let loaded = size.instructions().iter().find_map(|insn| match &insn.kind {
            InstructionKind::Constant(constant) => Some(constant.clone()),
            _ => None,
        });
        assert_eq!(loaded, Some(Constant::String("caf\u{e9}\0".to_string())));
    }

    #[test]
    fn distant_branches_are_widened() {
        let mut spec = MethodSpec::new("far", "(I)V")
            .op(opcodes::ILOAD_1)
            .jump(opcodes::IFEQ, "exit")
            .jump(opcodes::GOTO, "exit");
        for _ in 0..40_000 {
            spec = spec.op(opcodes::NOP);
        }
        let bytes = ClassSpec::new("Far")
            .method(spec.label("exit").op(opcodes::RETURN))
            .bytes();

        let (program, class) = reload(&bytes);
        let opcodes = opcodes_of(&program, class, "far");
        assert_eq!(
            &opcodes[..4],
            &[opcodes::ILOAD_1, opcodes::IFNE, opcodes::GOTO_W, opcodes::GOTO_W]
        );
        assert_eq!(opcodes.last(), Some(&opcodes::RETURN));

        let far = program.method_by_name(class, "far").expect("far");
        let far = program.method(far).expect("far");
        let return_label = far
            .instructions()
            .iter()
            .rev()
            .find_map(|insn| insn.label())
            .expect("label before return");
        let jumps: Vec<LabelId> = far
            .instructions()
            .iter()
            .filter(|insn| insn.opcode == opcodes::GOTO_W)
            .flat_map(|insn| insn.jump_targets())
            .collect();
        assert_eq!(jumps, vec![return_label, return_label]);
    }

    #[test]
    fn switches_keep_their_targets() {
        let bytes = ClassSpec::new("Switch")
            .method(
                MethodSpec::new("pick", "(I)I")
                    .op(opcodes::ILOAD_1)
                    .switch(opcodes::LOOKUPSWITCH, "other", &[(10, "ten"), (1, "one")])
                    .label("one")
                    .op(opcodes::ICONST_1)
                    .op(opcodes::IRETURN)
                    .label("ten")
                    .int(opcodes::BIPUSH, 10)
                    .op(opcodes::IRETURN)
                    .label("other")
                    .op(opcodes::ICONST_0)
                    .op(opcodes::IRETURN),
            )
            .bytes();
        let (program, class) = reload(&bytes);
        let pick = program.method_by_name(class, "pick").expect("pick");
        let pick = program.method(pick).expect("pick");
        let switch = pick
            .instructions()
            .iter()
            .find_map(|insn| match &insn.kind {
                InstructionKind::Switch(switch) => Some(switch.clone()),
                _ => None,
            })
            .expect("switch");
        let keys: Vec<i32> = switch.cases.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, vec![1, 10]);
        let one = pick.instructions().real_at_label(switch.cases[0].1).expect("case");
        assert_eq!(one.opcode, opcodes::ICONST_1);
        let other = pick.instructions().real_at_label(switch.default).expect("default");
        assert_eq!(other.opcode, opcodes::ICONST_0);
    }

    #[test]
    fn versions_depend_on_the_features_used() {
        let old = ClassSpec::new("Old").version(52).bytes();
        assert_eq!(u16::from_be_bytes([old[6], old[7]]), INFERENCE_VERSION);

        let handle = Constant::MethodHandle {
            kind: 6,
            owner: "java/lang/Integer".to_string(),
            name: "valueOf".to_string(),
            descriptor: "(I)Ljava/lang/Integer;".to_string(),
            is_interface: false,
        };
        let modern = ClassSpec::new("Modern")
            .version(52)
            .method(
                MethodSpec::new("h", "()Ljava/lang/Object;")
                    .ldc(handle)
                    .op(opcodes::ARETURN),
            )
            .bytes();
        assert_eq!(u16::from_be_bytes([modern[6], modern[7]]), 52);
    }

    #[test]
    fn unknown_labels_are_reported() {
        let program = Program::default();
        let class = ClassSpec::new("Broken")
            .method(MethodSpec::new("f", "()V").op(opcodes::RETURN))
            .load(&program);
        let method = program.method_by_name(class, "f").expect("f");
        let (stray, _) = program.new_label();
        let jump = program.new_instruction(opcodes::GOTO, InstructionKind::Jump(stray));
        program.update_method(method, |method| method.instructions.push(jump));

        let error = ClassWriter.encode(&program, class).expect_err("stray label");
        assert!(matches!(error, EncodeError::UnknownLabel { label, .. } if label == stray));
    }
}
