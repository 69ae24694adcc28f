//! Raw class-file bytes: big-endian cursors in both directions, the constant pool and Code
//! attribute decoding.
//!
//! Branch offsets, exception ranges and local-variable ranges are turned into labels here, so
//! nothing downstream ever deals with byte offsets.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::DecodeError;
use crate::ir::{
    CallKind, Constant, DynamicInsn, FieldAccess, FieldInsn, InstructionKind, LabelId,
    LocalVariable, MethodInsn, Switch, TryCatch,
};
use crate::opcodes;

/// Big-endian cursor over class-file bytes.
#[derive(Clone, Debug)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated {
                offset: self.offset,
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.bytes(len).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let high = self.u32()? as u64;
        let low = self.u32()? as u64;
        Ok(high << 32 | low)
    }
}

/// Big-endian byte sink, the writing counterpart of [`Reader`].
#[derive(Clone, Debug, Default)]
pub(crate) struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub(crate) fn i8(&mut self, value: i8) {
        self.u8(value as u8);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.bytes(&value.to_be_bytes());
    }

    pub(crate) fn i16(&mut self, value: i16) {
        self.bytes(&value.to_be_bytes());
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.bytes(&value.to_be_bytes());
    }

    pub(crate) fn i32(&mut self, value: i32) {
        self.bytes(&value.to_be_bytes());
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.bytes(&value.to_be_bytes());
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// One constant pool slot. The second slot of a long or double is `Empty`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PoolEntry {
    Empty,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
}

/// Resolved member reference from a `*ref` constant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_interface: bool,
}

/// Parsed constant pool with typed accessors.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConstantPool {
    entries: Vec<PoolEntry>,
}

impl ConstantPool {
    pub(crate) fn parse(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = reader.u16()? as usize;
        let mut entries = Vec::with_capacity(count.max(1));
        entries.push(PoolEntry::Empty);
        while entries.len() < count {
            let tag = reader.u8()?;
            let entry = match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    PoolEntry::Utf8(decode_modified_utf8(reader.bytes(len)?))
                }
                3 => PoolEntry::Integer(reader.i32()?),
                4 => PoolEntry::Float(f32::from_bits(reader.u32()?)),
                5 => PoolEntry::Long(reader.u64()? as i64),
                6 => PoolEntry::Double(f64::from_bits(reader.u64()?)),
                7 => PoolEntry::Class(reader.u16()?),
                8 => PoolEntry::String(reader.u16()?),
                9 => PoolEntry::FieldRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                10 => PoolEntry::MethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                11 => PoolEntry::InterfaceMethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                12 => PoolEntry::NameAndType {
                    name: reader.u16()?,
                    descriptor: reader.u16()?,
                },
                15 => PoolEntry::MethodHandle {
                    kind: reader.u8()?,
                    reference: reader.u16()?,
                },
                16 => PoolEntry::MethodType(reader.u16()?),
                17 => PoolEntry::Dynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                18 => PoolEntry::InvokeDynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                19 => PoolEntry::Module(reader.u16()?),
                20 => PoolEntry::Package(reader.u16()?),
                _ => {
                    return Err(DecodeError::ClassFile(format!(
                        "unknown constant pool tag {tag} at entry #{}",
                        entries.len()
                    )));
                }
            };
            let wide = matches!(entry, PoolEntry::Long(_) | PoolEntry::Double(_));
            entries.push(entry);
            if wide {
                entries.push(PoolEntry::Empty);
            }
        }
        Ok(Self { entries })
    }

    fn entry(&self, index: u16) -> Option<&PoolEntry> {
        self.entries.get(index as usize)
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str, DecodeError> {
        match self.entry(index) {
            Some(PoolEntry::Utf8(value)) => Ok(value),
            _ => Err(DecodeError::ConstantPool {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str, DecodeError> {
        match self.entry(index) {
            Some(PoolEntry::Class(name)) => self.utf8(*name),
            _ => Err(DecodeError::ConstantPool {
                index,
                expected: "Class",
            }),
        }
    }

    /// Like [`Self::class_name`], but index 0 means "none" (e.g. `java/lang/Object`'s super).
    pub(crate) fn optional_class_name(&self, index: u16) -> Result<Option<String>, DecodeError> {
        if index == 0 {
            return Ok(None);
        }
        self.class_name(index).map(|name| Some(name.to_string()))
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(&str, &str), DecodeError> {
        match self.entry(index) {
            Some(PoolEntry::NameAndType { name, descriptor }) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(DecodeError::ConstantPool {
                index,
                expected: "NameAndType",
            }),
        }
    }

    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef, DecodeError> {
        let (class, name_and_type, is_interface) = match self.entry(index) {
            Some(PoolEntry::FieldRef {
                class,
                name_and_type,
            })
            | Some(PoolEntry::MethodRef {
                class,
                name_and_type,
            }) => (*class, *name_and_type, false),
            Some(PoolEntry::InterfaceMethodRef {
                class,
                name_and_type,
            }) => (*class, *name_and_type, true),
            _ => {
                return Err(DecodeError::ConstantPool {
                    index,
                    expected: "member reference",
                });
            }
        };
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            owner: self.class_name(class)?.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_interface,
        })
    }

    /// Loadable constant at `index`, as used by `ldc*` and ConstantValue.
    pub(crate) fn constant(&self, index: u16) -> Result<Constant, DecodeError> {
        let constant = match self.entry(index) {
            Some(PoolEntry::Integer(value)) => Constant::Int(*value),
            Some(PoolEntry::Float(value)) => Constant::Float(*value),
            Some(PoolEntry::Long(value)) => Constant::Long(*value),
            Some(PoolEntry::Double(value)) => Constant::Double(*value),
            Some(PoolEntry::String(value)) => Constant::String(self.utf8(*value)?.to_string()),
            Some(PoolEntry::Class(name)) => Constant::Class(self.utf8(*name)?.to_string()),
            Some(PoolEntry::MethodType(descriptor)) => {
                Constant::MethodType(self.utf8(*descriptor)?.to_string())
            }
            Some(PoolEntry::MethodHandle { kind, reference }) => {
                let member = self.member_ref(*reference)?;
                Constant::MethodHandle {
                    kind: *kind,
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                    is_interface: member.is_interface,
                }
            }
            Some(PoolEntry::Dynamic {
                bootstrap,
                name_and_type,
            }) => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Constant::Dynamic {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    bootstrap: *bootstrap,
                }
            }
            _ => {
                return Err(DecodeError::ConstantPool {
                    index,
                    expected: "loadable constant",
                });
            }
        };
        Ok(constant)
    }

    pub(crate) fn invoke_dynamic(&self, index: u16) -> Result<DynamicInsn, DecodeError> {
        match self.entry(index) {
            Some(PoolEntry::InvokeDynamic {
                bootstrap,
                name_and_type,
            }) => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok(DynamicInsn {
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    bootstrap: *bootstrap,
                })
            }
            _ => Err(DecodeError::ConstantPool {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }
}

/// Class files store strings as modified UTF-8; anything standard UTF-8 can read is kept as is.
fn decode_modified_utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => String::from_utf16_lossy(&modified_utf8_units(bytes)),
    }
}

fn modified_utf8_units(bytes: &[u8]) -> Vec<u16> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index] as u16;
        let (unit, width) = if first & 0x80 == 0 {
            (first, 1)
        } else if first & 0xe0 == 0xc0 && index + 1 < bytes.len() {
            let second = bytes[index + 1] as u16;
            (((first & 0x1f) << 6) | (second & 0x3f), 2)
        } else if first & 0xf0 == 0xe0 && index + 2 < bytes.len() {
            let second = bytes[index + 1] as u16;
            let third = bytes[index + 2] as u16;
            (((first & 0x0f) << 12) | ((second & 0x3f) << 6) | (third & 0x3f), 3)
        } else {
            (0xfffd, 1)
        };
        units.push(unit);
        index += width;
    }
    units
}

/// Encodes `text` as modified UTF-8: NUL becomes two bytes and supplementary characters are
/// written as surrogate pairs.
pub(crate) fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        if unit != 0 && unit < 0x80 {
            bytes.push(unit as u8);
        } else if unit < 0x800 {
            bytes.push(0xc0 | (unit >> 6) as u8);
            bytes.push(0x80 | (unit & 0x3f) as u8);
        } else {
            bytes.push(0xe0 | (unit >> 12) as u8);
            bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
            bytes.push(0x80 | (unit & 0x3f) as u8);
        }
    }
    bytes
}

/// Exception table entry with the catch type already resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawHandler {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: Option<String>,
}

/// LocalVariableTable entry with names resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawLocal {
    pub(crate) start_pc: u16,
    pub(crate) length: u16,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) signature: Option<String>,
    pub(crate) index: u16,
}

/// A decoded method body: labels interleaved with instructions, plus label-based ranges.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct CodeBody {
    pub(crate) instructions: Vec<(u8, InstructionKind)>,
    pub(crate) try_catch: Vec<TryCatch>,
    pub(crate) local_variables: Vec<LocalVariable>,
}

/// Instruction whose branch operands are still byte offsets.
enum Pending {
    Ready(InstructionKind),
    Jump(usize),
    Switch {
        default: usize,
        cases: Vec<(i32, usize)>,
    },
}

/// Decodes one Code attribute.
///
/// `new_label` hands out program-wide label ids. Labels are created in offset order, only for
/// offsets something actually points at.
pub(crate) fn decode_code(
    code: &[u8],
    pool: &ConstantPool,
    handlers: &[RawHandler],
    locals: &[RawLocal],
    new_label: &mut dyn FnMut() -> LabelId,
) -> Result<CodeBody, DecodeError> {
    let mut reader = Reader::new(code);
    let mut decoded: Vec<(usize, u8, Pending)> = Vec::new();
    while !reader.is_empty() {
        let offset = reader.offset();
        let (opcode, pending) = decode_instruction(&mut reader, pool, offset)?;
        decoded.push((offset, opcode, pending));
    }

    let boundaries: BTreeSet<usize> = decoded
        .iter()
        .map(|(offset, _, _)| *offset)
        .chain(std::iter::once(code.len()))
        .collect();

    let mut targets = BTreeSet::new();
    for (offset, _, pending) in &decoded {
        match pending {
            Pending::Jump(target) => {
                targets.insert((*offset, *target));
            }
            Pending::Switch { default, cases } => {
                targets.insert((*offset, *default));
                for (_, target) in cases {
                    targets.insert((*offset, *target));
                }
            }
            Pending::Ready(_) => {}
        }
    }
    for handler in handlers {
        for pc in [handler.start_pc, handler.end_pc, handler.handler_pc] {
            targets.insert((handler.start_pc as usize, pc as usize));
        }
    }
    for local in locals {
        let end = local.start_pc as usize + local.length as usize;
        targets.insert((local.start_pc as usize, local.start_pc as usize));
        targets.insert((local.start_pc as usize, end));
    }

    let mut labels: BTreeMap<usize, LabelId> = BTreeMap::new();
    for (source, target) in &targets {
        if !boundaries.contains(target) {
            return Err(DecodeError::BadTarget {
                offset: *source,
                target: *target as i64,
            });
        }
        labels.entry(*target).or_insert(LabelId(0));
    }
    for label in labels.values_mut() {
        *label = new_label();
    }
    let label_at = |offset: usize| labels.get(&offset).copied();

    let mut body = CodeBody::default();
    for (offset, opcode, pending) in decoded {
        if let Some(label) = label_at(offset) {
            body.instructions
                .push((opcodes::LABEL, InstructionKind::Label(label)));
        }
        let kind = match pending {
            Pending::Ready(kind) => kind,
            Pending::Jump(target) => InstructionKind::Jump(resolved(label_at(target), offset)?),
            Pending::Switch { default, cases } => {
                let default = resolved(label_at(default), offset)?;
                let cases = cases
                    .into_iter()
                    .map(|(key, target)| resolved(label_at(target), offset).map(|label| (key, label)))
                    .collect::<Result<Vec<_>, _>>()?;
                InstructionKind::Switch(Switch { default, cases })
            }
        };
        body.instructions.push((opcode, kind));
    }
    if let Some(label) = label_at(code.len()) {
        body.instructions
            .push((opcodes::LABEL, InstructionKind::Label(label)));
    }

    for handler in handlers {
        let start = handler.start_pc as usize;
        body.try_catch.push(TryCatch {
            start: resolved(label_at(start), start)?,
            end: resolved(label_at(handler.end_pc as usize), start)?,
            handler: resolved(label_at(handler.handler_pc as usize), start)?,
            catch_type: handler.catch_type.clone(),
        });
    }
    for local in locals {
        let start = local.start_pc as usize;
        let end = start + local.length as usize;
        body.local_variables.push(LocalVariable {
            name: local.name.clone(),
            descriptor: local.descriptor.clone(),
            signature: local.signature.clone(),
            start: resolved(label_at(start), start)?,
            end: resolved(label_at(end), start)?,
            index: local.index,
            references: BTreeSet::new(),
        });
    }

    Ok(body)
}

fn resolved(label: Option<LabelId>, offset: usize) -> Result<LabelId, DecodeError> {
    label.ok_or(DecodeError::BadTarget {
        offset,
        target: -1,
    })
}

fn branch_target(offset: usize, delta: i64) -> Result<usize, DecodeError> {
    let target = offset as i64 + delta;
    usize::try_from(target).map_err(|_| DecodeError::BadTarget { offset, target })
}

/// Bytes of padding after a switch opcode so its operands start 4-byte aligned.
fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn decode_instruction(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
    offset: usize,
) -> Result<(u8, Pending), DecodeError> {
    use opcodes::*;

    let opcode = reader.u8()?;
    let kind = match opcode {
        NOP..=DCONST_1 => InstructionKind::Simple,
        BIPUSH => InstructionKind::Int(reader.i8()? as i32),
        SIPUSH => InstructionKind::Int(reader.i16()? as i32),
        LDC => InstructionKind::Constant(pool.constant(reader.u8()? as u16)?),
        LDC_W | LDC2_W => InstructionKind::Constant(pool.constant(reader.u16()?)?),
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => InstructionKind::Var(reader.u8()? as u16),
        ILOAD_0..=SALOAD | ISTORE_0..=LXOR => InstructionKind::Simple,
        IINC => InstructionKind::Iinc {
            index: reader.u8()? as u16,
            delta: reader.i8()? as i16,
        },
        I2L..=DCMPG => InstructionKind::Simple,
        IFEQ..=JSR | IFNULL | IFNONNULL => {
            let target = branch_target(offset, reader.i16()? as i64)?;
            return Ok((opcode, Pending::Jump(target)));
        }
        GOTO_W | JSR_W => {
            let target = branch_target(offset, reader.i32()? as i64)?;
            return Ok((opcode, Pending::Jump(target)));
        }
        TABLESWITCH => {
            reader.skip(padding(offset))?;
            let default = branch_target(offset, reader.i32()? as i64)?;
            let low = reader.i32()?;
            let high = reader.i32()?;
            if high < low {
                return Err(DecodeError::ClassFile(format!(
                    "tableswitch at offset {offset} has low {low} above high {high}"
                )));
            }
            let mut cases = Vec::new();
            for key in low..=high {
                cases.push((key, branch_target(offset, reader.i32()? as i64)?));
            }
            return Ok((opcode, Pending::Switch { default, cases }));
        }
        LOOKUPSWITCH => {
            reader.skip(padding(offset))?;
            let default = branch_target(offset, reader.i32()? as i64)?;
            let pairs = reader.i32()?;
            let mut cases = Vec::new();
            for _ in 0..pairs.max(0) {
                let key = reader.i32()?;
                cases.push((key, branch_target(offset, reader.i32()? as i64)?));
            }
            return Ok((opcode, Pending::Switch { default, cases }));
        }
        IRETURN..=RETURN | ARRAYLENGTH | ATHROW | MONITORENTER | MONITOREXIT => {
            InstructionKind::Simple
        }
        GETSTATIC..=PUTFIELD => {
            let member = pool.member_ref(reader.u16()?)?;
            InstructionKind::Field(FieldInsn {
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
                access: if matches!(opcode, GETSTATIC | GETFIELD) {
                    FieldAccess::Read
                } else {
                    FieldAccess::Write
                },
                is_static: matches!(opcode, GETSTATIC | PUTSTATIC),
            })
        }
        INVOKEVIRTUAL..=INVOKEINTERFACE => {
            let member = pool.member_ref(reader.u16()?)?;
            if opcode == INVOKEINTERFACE {
                reader.skip(2)?;
            }
            let kind = match opcode {
                INVOKEVIRTUAL => CallKind::Virtual,
                INVOKESPECIAL => CallKind::Special,
                INVOKESTATIC => CallKind::Static,
                _ => CallKind::Interface,
            };
            InstructionKind::Method(MethodInsn {
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
                is_interface: member.is_interface,
                kind,
            })
        }
        INVOKEDYNAMIC => {
            let dynamic = pool.invoke_dynamic(reader.u16()?)?;
            reader.skip(2)?;
            InstructionKind::InvokeDynamic(dynamic)
        }
        NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
            InstructionKind::Type(pool.class_name(reader.u16()?)?.to_string())
        }
        NEWARRAY => InstructionKind::NewArray(reader.u8()?),
        WIDE => {
            let widened = reader.u8()?;
            let index = reader.u16()?;
            let kind = if widened == IINC {
                InstructionKind::Iinc {
                    index,
                    delta: reader.i16()?,
                }
            } else if matches!(widened, ILOAD..=ALOAD | ISTORE..=ASTORE | RET) {
                InstructionKind::Var(index)
            } else {
                return Err(DecodeError::UnknownOpcode {
                    opcode: widened,
                    offset: offset + 1,
                });
            };
            return Ok((widened, Pending::Ready(kind)));
        }
        MULTIANEWARRAY => InstructionKind::MultiANewArray {
            class: pool.class_name(reader.u16()?)?.to_string(),
            dimensions: reader.u8()?,
        },
        _ => return Err(DecodeError::UnknownOpcode { opcode, offset }),
    };
    Ok((opcode, Pending::Ready(kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConstantPool {
        ConstantPool {
            entries: vec![
                PoolEntry::Empty,
                PoolEntry::Utf8("Foo".to_string()),
                PoolEntry::Class(1),
                PoolEntry::Utf8("x".to_string()),
                PoolEntry::Utf8("I".to_string()),
                PoolEntry::NameAndType {
                    name: 3,
                    descriptor: 4,
                },
                PoolEntry::FieldRef {
                    class: 2,
                    name_and_type: 5,
                },
                PoolEntry::Long(7),
                PoolEntry::Empty,
            ],
        }
    }

    fn counter() -> impl FnMut() -> LabelId {
        let mut next = 100;
        move || {
            next += 1;
            LabelId(next)
        }
    }

    #[test]
    fn branches_become_labels() {
        // 0: iload_0, 1: ifeq +5 -> 6, 4: iconst_1, 5: ireturn, 6: iconst_0, 7: ireturn
        let code = [0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let body = decode_code(&code, &pool(), &[], &[], &mut counter()).expect("decode");

        let opcodes: Vec<u8> = body.instructions.iter().map(|(op, _)| *op).collect();
        assert_eq!(
            opcodes,
            vec![
                opcodes::ILOAD_0,
                opcodes::IFEQ,
                opcodes::ICONST_1,
                opcodes::IRETURN,
                opcodes::LABEL,
                opcodes::ICONST_0,
                opcodes::IRETURN,
            ]
        );
        assert_eq!(body.instructions[1].1, InstructionKind::Jump(LabelId(101)));
        assert_eq!(body.instructions[4].1, InstructionKind::Label(LabelId(101)));
    }

    #[test]
    fn wide_and_pool_operands() {
        // getstatic #6, ldc2_w #7, wide iinc 300 -2, return
        let code = [
            0xb2, 0x00, 0x06, 0x14, 0x00, 0x07, 0xc4, 0x84, 0x01, 0x2c, 0xff, 0xfe, 0xb1,
        ];
        let body = decode_code(&code, &pool(), &[], &[], &mut counter()).expect("decode");
        assert_eq!(body.instructions.len(), 4);
        match &body.instructions[0].1 {
            InstructionKind::Field(field) => {
                assert_eq!(field.key(), "Foo.x");
                assert_eq!(field.access, FieldAccess::Read);
                assert!(field.is_static);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            body.instructions[1].1,
            InstructionKind::Constant(Constant::Long(7))
        );
        assert_eq!(
            body.instructions[2],
            (
                opcodes::IINC,
                InstructionKind::Iinc {
                    index: 300,
                    delta: -2
                }
            )
        );
    }

    #[test]
    fn tableswitch_respects_padding() {
        // 0: iload_0, 1: tableswitch pad(2) default=+23 low=0 high=1 [+23, +24]
        let mut code = vec![0x1a, 0xaa, 0x00, 0x00];
        for value in [23i32, 0, 1, 23, 24] {
            code.extend_from_slice(&value.to_be_bytes());
        }
        code.extend_from_slice(&[0xb1, 0xb1]);
        let body = decode_code(&code, &pool(), &[], &[], &mut counter()).expect("decode");
        match &body.instructions[1].1 {
            InstructionKind::Switch(switch) => {
                assert_eq!(switch.cases.len(), 2);
                assert_eq!(switch.default, switch.cases[0].1);
                assert_ne!(switch.cases[0].1, switch.cases[1].1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exception_ranges_and_bad_targets() {
        // 0: nop, 1: return, 2: astore_1, 3: return
        let code = [0x00, 0xb1, 0x4c, 0xb1];
        let handler = RawHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: Some("java/lang/Exception".to_string()),
        };
        let body = decode_code(&code, &pool(), &[handler.clone()], &[], &mut counter())
            .expect("decode");
        assert_eq!(body.try_catch.len(), 1);
        assert_eq!(body.try_catch[0].end, body.try_catch[0].handler);

        let broken = RawHandler {
            handler_pc: 9,
            ..handler
        };
        let error = decode_code(&code, &pool(), &[broken], &[], &mut counter()).unwrap_err();
        assert!(matches!(error, DecodeError::BadTarget { target: 9, .. }));

        let truncated = decode_code(&[0x11, 0x00], &pool(), &[], &[], &mut counter()).unwrap_err();
        assert!(matches!(truncated, DecodeError::Truncated { .. }));
    }

    #[test]
    fn modified_utf8_survives_nul_and_supplementary_characters() {
        let text = "a\0b\u{1F600}é";
        let bytes = encode_modified_utf8(text);
        assert_eq!(&bytes[..4], &[b'a', 0xc0, 0x80, b'b']);
        assert!(!bytes.contains(&0));
        assert_eq!(bytes.len(), 4 + 6 + 2);
        assert_eq!(decode_modified_utf8(&bytes), text);
    }
}
