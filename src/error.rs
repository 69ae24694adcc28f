//! Error types for scanning, decoding, control-flow analysis and mutation.
//!
//! Errors fall into three groups that are propagated differently:
//!
//! - [`ScanError`] is a configuration problem of the caller and always surfaces to the top.
//! - [`DecodeError`] and [`AnalyzerError`] describe one malformed class or method. The scan
//!   pipeline logs them and keeps going with the rest of the batch.
//! - [`EncodeError`] means a class could not be written back; output passes report it per class.
//! - [`MutationError`] reports a misuse of a mutation primitive (unknown id, name clash). The
//!   primitive leaves the program untouched when it returns one.
//!
//! A reference that cannot be resolved is not an error; lookups return `None`.

use std::path::PathBuf;

use thiserror::Error;

use crate::ir::{ClassId, FieldId, LabelId, MethodId};

/// Errors raised before or around a scan. These are never retried or swallowed.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A scan was requested without an input location.
    #[error("no input location was set for the scanner")]
    NoInput,

    /// The input location does not exist.
    #[error("input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// Passes were launched before anything was scanned.
    #[error("the scanner has not been run; call scan() before launching passes")]
    Uninitialized,

    /// The input is neither a directory, a `.class` nor a `.jar` file.
    #[error("unsupported input file: {}", .0.display())]
    Unsupported(PathBuf),

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// A file or directory under the input could not be read.
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Archive(#[from] zip::result::ZipError),
}

/// A class file could not be turned into entities.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The class-file parser rejected the bytes.
    #[error("malformed class file: {0}")]
    ClassFile(String),

    /// A constant pool index pointed at the wrong kind of entry.
    #[error("constant pool entry #{index} is not a {expected}")]
    ConstantPool { index: u16, expected: &'static str },

    /// The Code attribute ended in the middle of an instruction.
    #[error("truncated bytecode at offset {offset}")]
    Truncated { offset: usize },

    /// An opcode outside the JVM instruction set.
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// A branch, exception range or local-variable range points outside the code.
    #[error("offset {target} referenced from offset {offset} is not an instruction boundary")]
    BadTarget { offset: usize, target: i64 },
}

/// Control-flow analysis of one method failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("stack underflow at instruction {position}")]
    StackUnderflow { position: usize },

    #[error("inconsistent stack height at instruction {position}: {expected} vs {found}")]
    InconsistentStack {
        position: usize,
        expected: usize,
        found: usize,
    },

    #[error("stack height {height} exceeds max_stack {max} at instruction {position}")]
    StackOverflow {
        position: usize,
        height: usize,
        max: usize,
    },

    #[error("execution can fall off the end of the code after instruction {position}")]
    FallOffEnd { position: usize },

    #[error("instruction {position} jumps to a label that is not in the method")]
    UnknownLabel { position: usize },

    #[error("malformed descriptor `{descriptor}` at instruction {position}")]
    Descriptor { position: usize, descriptor: String },
}

/// A class could not be turned back into class-file bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("class {0:?} is not loaded")]
    UnknownClass(ClassId),

    #[error("`{method}` refers to label {label:?}, which is not in its code")]
    UnknownLabel { method: String, label: LabelId },

    #[error("code of `{method}` is longer than 65535 bytes")]
    CodeTooLarge { method: String },

    #[error("the constant pool is full")]
    PoolOverflow,

    #[error("string constant of {0} bytes is too long")]
    StringTooLong(usize),
}

/// A mutation primitive was called with arguments it cannot honor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("class {0:?} is not loaded")]
    UnknownClass(ClassId),

    #[error("field {0:?} is not loaded")]
    UnknownField(FieldId),

    #[error("method {0:?} is not loaded")]
    UnknownMethod(MethodId),

    /// The new key is already owned by a different live entity.
    #[error("`{0}` is already taken")]
    NameTaken(String),

    /// Constructors and static initializers keep their JVM-mandated names.
    #[error("constructor {0:?} cannot be renamed")]
    Constructor(MethodId),

    #[error("member is already declared by the destination class")]
    SameOwner,
}
