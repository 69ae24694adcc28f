//! Renamers for classes, fields and methods with unhelpful names.
//!
//! A name is unhelpful when it is at most three characters long or longer than sixty. Renamed
//! entities get sequential names (`ClassN`, `fieldN`, `methodN`); a candidate that is already
//! taken is skipped.

use anyhow::Result;

use crate::error::MutationError;
use crate::ir::{Access, AccessFlags};
use crate::passes::{
    Node, NodeKind, Pass, PassContext, PassMetadata, in_override_family, is_entry_point,
};

pub const CLASS_RENAMER: &str = "class-renamer";
pub const FIELD_RENAMER: &str = "field-renamer";
pub const METHOD_RENAMER: &str = "method-renamer";

/// Whether `name` should be replaced.
pub fn is_unhelpful(name: &str) -> bool {
    let length = name.chars().count();
    length <= 3 || length > 60
}

/// Tries `candidate(n)` for increasing `n` until `rename` accepts one.
fn rename_with(
    counter: &mut usize,
    candidate: impl Fn(usize) -> String,
    mut rename: impl FnMut(&str) -> Result<(), MutationError>,
) -> Result<()> {
    loop {
        *counter += 1;
        match rename(&candidate(*counter)) {
            Ok(()) => return Ok(()),
            Err(MutationError::NameTaken(_)) => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

#[derive(Default)]
pub struct ClassRenamer {
    counter: usize,
}

impl Pass for ClassRenamer {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: CLASS_RENAMER,
            name: "Class renamer",
            description: "Gives classes with very short or very long names sequential names",
            kind: NodeKind::Class,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Class(id) = node else {
            return Ok(());
        };
        let Some(name) = context.program().class_name(id) else {
            return Ok(());
        };
        let (package, simple) = match name.rsplit_once('/') {
            Some((package, simple)) => (format!("{package}/"), simple),
            None => (String::new(), name.as_str()),
        };
        if !is_unhelpful(simple) {
            return Ok(());
        }
        rename_with(
            &mut self.counter,
            |n| format!("{package}Class{n}"),
            |candidate| context.rename_class(id, candidate),
        )
    }
}

#[derive(Default)]
pub struct FieldRenamer {
    counter: usize,
}

impl Pass for FieldRenamer {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: FIELD_RENAMER,
            name: "Field renamer",
            description: "Gives fields with very short or very long names sequential names",
            kind: NodeKind::Field,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Field(id) = node else {
            return Ok(());
        };
        let unhelpful = context
            .program()
            .field(id)
            .is_some_and(|field| is_unhelpful(field.name()));
        if !unhelpful {
            return Ok(());
        }
        rename_with(
            &mut self.counter,
            |n| format!("field{n}"),
            |candidate| context.rename_field(id, candidate),
        )
    }
}

#[derive(Default)]
pub struct MethodRenamer {
    counter: usize,
}

impl Pass for MethodRenamer {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: METHOD_RENAMER,
            name: "Method renamer",
            description: "Gives methods with very short or very long names sequential names",
            kind: NodeKind::Method,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Node::Method(id) = node else {
            return Ok(());
        };
        let program = context.program();
        let unhelpful = program.method(id).is_some_and(|method| {
            !method.access().contains(AccessFlags::NATIVE)
                && is_unhelpful(method.name())
        });
        if !unhelpful || is_entry_point(program, id) || in_override_family(program, id) {
            return Ok(());
        }
        rename_with(
            &mut self.counter,
            |n| format!("method{n}"),
            |candidate| context.rename_method(id, candidate),
        )
    }
}
