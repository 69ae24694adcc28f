//! Class-file decoder: validates bytes with `jclassfile` and drives a [`ClassVisitor`].

use jclassfile::class_file;
use tracing::warn;

use crate::bytecode::{self, ConstantPool, RawHandler, RawLocal, Reader};
use crate::error::DecodeError;
use crate::ir::{AccessFlags, Annotation, AnnotationValue, BootstrapMethod};
use crate::model::{ClassHeader, ClassVisitor, FieldDecl, MethodDecl};

const MAGIC: u32 = 0xcafe_babe;

struct RawCode<'a> {
    max_stack: u16,
    max_locals: u16,
    code: &'a [u8],
    handlers: Vec<RawHandler>,
    locals: Vec<RawLocal>,
}

struct RawMethod<'a> {
    decl: MethodDecl,
    code: Option<RawCode<'a>>,
}

struct RawClass<'a> {
    pool: ConstantPool,
    header: ClassHeader,
    fields: Vec<FieldDecl>,
    methods: Vec<RawMethod<'a>>,
}

/// Decodes one class file and replays it into `visitor`.
///
/// Structural problems fail the whole class before any callback fires. A method body that
/// cannot be decoded is logged and left empty; the rest of the class is still visited.
pub fn decode_class(
    data: &[u8],
    visitor: &mut dyn ClassVisitor,
    skip_debug: bool,
) -> Result<String, DecodeError> {
    class_file::parse(data).map_err(|error| DecodeError::ClassFile(error.to_string()))?;
    let raw = read_class(data, skip_debug)?;
    let name = raw.header.name.clone();

    visitor.visit_class(raw.header);
    for field in raw.fields {
        visitor.visit_field(field);
    }
    for method in raw.methods {
        let method_name = method.decl.name.clone();
        visitor.visit_method(method.decl);
        let Some(code) = method.code else {
            visitor.visit_method_end(None, None);
            continue;
        };
        let body = bytecode::decode_code(
            code.code,
            &raw.pool,
            &code.handlers,
            &code.locals,
            &mut || visitor.new_label(),
        );
        match body {
            Ok(body) => {
                for (opcode, kind) in body.instructions {
                    visitor.visit_instruction(opcode, kind);
                }
                for try_catch in body.try_catch {
                    visitor.visit_try_catch(try_catch);
                }
                for variable in body.local_variables {
                    visitor.visit_local_variable(variable);
                }
                visitor.visit_method_end(Some(code.max_stack), Some(code.max_locals));
            }
            Err(error) => {
                warn!(class = %name, method = %method_name, %error, "method body skipped");
                visitor.visit_method_end(None, None);
            }
        }
    }
    visitor.visit_class_end();
    Ok(name)
}

fn read_class(data: &[u8], skip_debug: bool) -> Result<RawClass<'_>, DecodeError> {
    let mut reader = Reader::new(data);
    if reader.u32()? != MAGIC {
        return Err(DecodeError::ClassFile("bad magic number".to_string()));
    }
    let _minor = reader.u16()?;
    let major = reader.u16()?;
    let pool = ConstantPool::parse(&mut reader)?;
    let access = AccessFlags::from_bits_retain(reader.u16()?);
    let name = pool.class_name(reader.u16()?)?.to_string();
    let super_name = pool.optional_class_name(reader.u16()?)?;
    let interface_count = reader.u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(reader.u16()?)?.to_string());
    }

    let field_count = reader.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(read_field(&mut reader, &pool)?);
    }

    let method_count = reader.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(read_method(&mut reader, &pool, skip_debug)?);
    }

    let mut signature = None;
    let mut annotations = Vec::new();
    let mut bootstrap_methods = Vec::new();
    let attribute_count = reader.u16()?;
    for _ in 0..attribute_count {
        let (attribute, mut body) = read_attribute(&mut reader, &pool)?;
        match attribute {
            "Signature" => signature = Some(pool.utf8(body.u16()?)?.to_string()),
            "RuntimeVisibleAnnotations" => annotations = read_annotations(&mut body, &pool)?,
            "BootstrapMethods" => bootstrap_methods = read_bootstrap_methods(&mut body, &pool)?,
            _ => {}
        }
    }

    Ok(RawClass {
        header: ClassHeader {
            name,
            super_name,
            interfaces,
            signature,
            access,
            version: major,
            annotations,
            bootstrap_methods,
        },
        pool,
        fields,
        methods,
    })
}

/// Attribute name plus a reader over exactly its body.
fn read_attribute<'a, 'p>(
    reader: &mut Reader<'a>,
    pool: &'p ConstantPool,
) -> Result<(&'p str, Reader<'a>), DecodeError> {
    let name = pool.utf8(reader.u16()?)?;
    let len = reader.u32()? as usize;
    Ok((name, Reader::new(reader.bytes(len)?)))
}

fn read_field(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<FieldDecl, DecodeError> {
    let access = AccessFlags::from_bits_retain(reader.u16()?);
    let name = pool.utf8(reader.u16()?)?.to_string();
    let descriptor = pool.utf8(reader.u16()?)?.to_string();
    let mut field = FieldDecl {
        name,
        descriptor,
        access,
        ..FieldDecl::default()
    };
    let attribute_count = reader.u16()?;
    for _ in 0..attribute_count {
        let (attribute, mut body) = read_attribute(reader, pool)?;
        match attribute {
            "ConstantValue" => field.value = Some(pool.constant(body.u16()?)?),
            "Signature" => field.signature = Some(pool.utf8(body.u16()?)?.to_string()),
            "RuntimeVisibleAnnotations" => field.annotations = read_annotations(&mut body, pool)?,
            _ => {}
        }
    }
    Ok(field)
}

fn read_method<'a>(
    reader: &mut Reader<'a>,
    pool: &ConstantPool,
    skip_debug: bool,
) -> Result<RawMethod<'a>, DecodeError> {
    let access = AccessFlags::from_bits_retain(reader.u16()?);
    let name = pool.utf8(reader.u16()?)?.to_string();
    let descriptor = pool.utf8(reader.u16()?)?.to_string();
    let mut decl = MethodDecl {
        name,
        descriptor,
        access,
        ..MethodDecl::default()
    };
    let mut code = None;
    let attribute_count = reader.u16()?;
    for _ in 0..attribute_count {
        let (attribute, mut body) = read_attribute(reader, pool)?;
        match attribute {
            "Code" => code = Some(read_code(&mut body, pool, skip_debug)?),
            "Exceptions" => {
                let count = body.u16()?;
                for _ in 0..count {
                    decl.exceptions
                        .push(pool.class_name(body.u16()?)?.to_string());
                }
            }
            "Signature" => decl.signature = Some(pool.utf8(body.u16()?)?.to_string()),
            "RuntimeVisibleAnnotations" => decl.annotations = read_annotations(&mut body, pool)?,
            _ => {}
        }
    }
    Ok(RawMethod { decl, code })
}

fn read_code<'a>(
    reader: &mut Reader<'a>,
    pool: &ConstantPool,
    skip_debug: bool,
) -> Result<RawCode<'a>, DecodeError> {
    let max_stack = reader.u16()?;
    let max_locals = reader.u16()?;
    let code_len = reader.u32()? as usize;
    let code = reader.bytes(code_len)?;

    let handler_count = reader.u16()?;
    let mut handlers = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        let start_pc = reader.u16()?;
        let end_pc = reader.u16()?;
        let handler_pc = reader.u16()?;
        let catch_type = pool.optional_class_name(reader.u16()?)?;
        handlers.push(RawHandler {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        });
    }

    let mut locals = Vec::new();
    let mut signatures = Vec::new();
    let attribute_count = reader.u16()?;
    for _ in 0..attribute_count {
        let (attribute, mut body) = read_attribute(reader, pool)?;
        match attribute {
            "LocalVariableTable" if !skip_debug => {
                let count = body.u16()?;
                for _ in 0..count {
                    locals.push(RawLocal {
                        start_pc: body.u16()?,
                        length: body.u16()?,
                        name: pool.utf8(body.u16()?)?.to_string(),
                        descriptor: pool.utf8(body.u16()?)?.to_string(),
                        signature: None,
                        index: body.u16()?,
                    });
                }
            }
            "LocalVariableTypeTable" if !skip_debug => {
                let count = body.u16()?;
                for _ in 0..count {
                    let start_pc = body.u16()?;
                    let _length = body.u16()?;
                    let _name = body.u16()?;
                    let signature = pool.utf8(body.u16()?)?.to_string();
                    let index = body.u16()?;
                    signatures.push((start_pc, index, signature));
                }
            }
            _ => {}
        }
    }
    for (start_pc, index, signature) in signatures {
        if let Some(local) = locals
            .iter_mut()
            .find(|local| local.start_pc == start_pc && local.index == index)
        {
            local.signature = Some(signature);
        }
    }

    Ok(RawCode {
        max_stack,
        max_locals,
        code,
        handlers,
        locals,
    })
}

fn read_bootstrap_methods(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
) -> Result<Vec<BootstrapMethod>, DecodeError> {
    let count = reader.u16()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let handle = pool.constant(reader.u16()?)?;
        let argument_count = reader.u16()?;
        let mut arguments = Vec::with_capacity(argument_count as usize);
        for _ in 0..argument_count {
            arguments.push(pool.constant(reader.u16()?)?);
        }
        methods.push(BootstrapMethod { handle, arguments });
    }
    Ok(methods)
}

/// RuntimeVisibleAnnotations body. Elements that do not map to an [`AnnotationValue`] are
/// dropped.
fn read_annotations(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
) -> Result<Vec<Annotation>, DecodeError> {
    let count = reader.u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(read_annotation(reader, pool)?);
    }
    Ok(annotations)
}

fn read_annotation(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<Annotation, DecodeError> {
    let descriptor = pool.utf8(reader.u16()?)?.to_string();
    let pairs = reader.u16()?;
    let mut values = Vec::new();
    for _ in 0..pairs {
        let name = pool.utf8(reader.u16()?)?.to_string();
        if let Some(value) = read_element_value(reader, pool)? {
            values.push((name, value));
        }
    }
    Ok(Annotation { descriptor, values })
}

fn read_element_value(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
) -> Result<Option<AnnotationValue>, DecodeError> {
    use crate::ir::Constant;

    let tag = reader.u8()?;
    let value = match tag {
        b'B' | b'C' | b'I' | b'S' | b'J' | b'Z' => {
            let index = reader.u16()?;
            let number = match pool.constant(index)? {
                Constant::Int(value) => value as i64,
                Constant::Long(value) => value,
                _ => {
                    return Err(DecodeError::ConstantPool {
                        index,
                        expected: "integral constant",
                    });
                }
            };
            if tag == b'Z' {
                Some(AnnotationValue::Bool(number != 0))
            } else {
                Some(AnnotationValue::Int(number))
            }
        }
        b's' => Some(AnnotationValue::Str(pool.utf8(reader.u16()?)?.to_string())),
        b'c' => Some(AnnotationValue::Str(pool.utf8(reader.u16()?)?.to_string())),
        b'F' | b'D' => {
            reader.skip(2)?;
            None
        }
        b'e' => {
            reader.skip(4)?;
            None
        }
        b'@' => {
            read_annotation(reader, pool)?;
            None
        }
        b'[' => {
            let count = reader.u16()?;
            for _ in 0..count {
                read_element_value(reader, pool)?;
            }
            None
        }
        _ => {
            return Err(DecodeError::ClassFile(format!(
                "unknown annotation element tag {tag}"
            )));
        }
    };
    Ok(value)
}
