//! Pass pipeline: passes visit the live entities of one node kind and mutate the program
//! through [`PassContext`], which records every change as an [`Edit`].

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::error::MutationError;
use crate::ir::{Access, AnnotationValue, ClassId, FieldId, InsnRef, MethodId};
use crate::mutate;
use crate::program::Program;

pub mod dead_code;
pub mod inline;
pub mod jumps;
pub mod remove;
pub mod rename;

/// Entity kinds a pass can ask to visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Class,
    /// Methods other than constructors and static initializers.
    Method,
    /// `<init>` and `<clinit>`.
    Constructor,
    Field,
    FieldRead,
    FieldWrite,
    /// `invoke*` instructions, resolved or not.
    MethodReference,
    Annotation,
    Block,
}

/// Entity carrying an annotation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationOwner {
    Class(ClassId),
    Field(FieldId),
    Method(MethodId),
}

/// One element produced by [`Nodes`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    Class(ClassId),
    Method(MethodId),
    Constructor(MethodId),
    Field(FieldId),
    FieldRead(InsnRef),
    FieldWrite(InsnRef),
    MethodReference(InsnRef),
    Annotation { owner: AnnotationOwner, index: usize },
    Block { method: MethodId, index: usize },
}

#[derive(Clone, Copy)]
enum Owner {
    Class(ClassId),
    Field(FieldId),
    Method(MethodId),
}

/// Lazy traversal over the live entities of one kind.
///
/// The owning entities are listed when the traversal starts; each one is expanded only when the
/// traversal reaches it, so entities deleted by earlier visits are skipped and renamed ones are
/// seen under their current names. Entities created during the traversal are not visited.
pub struct Nodes<'p> {
    program: &'p Program,
    kind: NodeKind,
    owners: VecDeque<Owner>,
    pending: VecDeque<Node>,
}

impl<'p> Nodes<'p> {
    pub fn new(program: &'p Program, kind: NodeKind) -> Self {
        let owners = match kind {
            NodeKind::Class => program.class_ids().into_iter().map(Owner::Class).collect(),
            NodeKind::Field => program.field_ids().into_iter().map(Owner::Field).collect(),
            NodeKind::Annotation => program
                .class_ids()
                .into_iter()
                .map(Owner::Class)
                .chain(program.field_ids().into_iter().map(Owner::Field))
                .chain(program.method_ids().into_iter().map(Owner::Method))
                .collect(),
            _ => program
                .method_ids()
                .into_iter()
                .map(Owner::Method)
                .collect(),
        };
        Self {
            program,
            kind,
            owners,
            pending: VecDeque::new(),
        }
    }

    fn expand(&mut self, owner: Owner) {
        let program = self.program;
        match (self.kind, owner) {
            (NodeKind::Class, Owner::Class(id)) => {
                if program.class(id).is_some() {
                    self.pending.push_back(Node::Class(id));
                }
            }
            (NodeKind::Field, Owner::Field(id)) => {
                if program.field(id).is_some() {
                    self.pending.push_back(Node::Field(id));
                }
            }
            (NodeKind::Annotation, owner) => {
                let count = match owner {
                    Owner::Class(id) => program.class(id).map(|class| class.annotations.len()),
                    Owner::Field(id) => program.field(id).map(|field| field.annotations.len()),
                    Owner::Method(id) => {
                        program.method(id).map(|method| method.annotations.len())
                    }
                };
                let owner = match owner {
                    Owner::Class(id) => AnnotationOwner::Class(id),
                    Owner::Field(id) => AnnotationOwner::Field(id),
                    Owner::Method(id) => AnnotationOwner::Method(id),
                };
                for index in 0..count.unwrap_or(0) {
                    self.pending.push_back(Node::Annotation { owner, index });
                }
            }
            (kind, Owner::Method(id)) => {
                let Some(method) = program.method(id) else {
                    return;
                };
                match kind {
                    NodeKind::Method if !method.is_constructor() => {
                        self.pending.push_back(Node::Method(id));
                    }
                    NodeKind::Constructor if method.is_constructor() => {
                        self.pending.push_back(Node::Constructor(id));
                    }
                    NodeKind::FieldRead => self.pending.extend(
                        method
                            .field_reads()
                            .map(|(insn, _)| Node::FieldRead(InsnRef::new(id, insn.id()))),
                    ),
                    NodeKind::FieldWrite => self.pending.extend(
                        method
                            .field_writes()
                            .map(|(insn, _)| Node::FieldWrite(InsnRef::new(id, insn.id()))),
                    ),
                    NodeKind::MethodReference => self.pending.extend(
                        method
                            .method_calls()
                            .map(|(insn, _)| Node::MethodReference(InsnRef::new(id, insn.id()))),
                    ),
                    NodeKind::Block => self.pending.extend(
                        (0..method.blocks().len()).map(|index| Node::Block { method: id, index }),
                    ),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

impl Iterator for Nodes<'_> {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        loop {
            if let Some(node) = self.pending.pop_front() {
                return Some(node);
            }
            let owner = self.owners.pop_front()?;
            self.expand(owner);
        }
    }
}

/// Metadata describing a pass.
#[derive(Clone, Debug)]
pub struct PassMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: NodeKind,
}

/// Transformation run by a [`Pipeline`].
pub trait Pass: Send {
    fn metadata(&self) -> PassMetadata;

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()>;

    /// Called once after the last node.
    fn finish(&mut self, _context: &mut PassContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Entity an edit applies to, named as it was when the edit was made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditTarget {
    Class(String),
    Field {
        owner: String,
        name: String,
    },
    Method {
        owner: String,
        name: String,
        descriptor: String,
    },
    /// A file written by an output pass.
    File(String),
}

/// One change made by a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    pub pass: &'static str,
    pub target: EditTarget,
    pub message: String,
}

/// What a pass sees of the program while it runs.
pub struct PassContext<'p> {
    program: &'p Program,
    pass: &'static str,
    edits: Vec<Edit>,
}

impl<'p> PassContext<'p> {
    pub fn new(program: &'p Program, pass: &'static str) -> Self {
        Self {
            program,
            pass,
            edits: Vec::new(),
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn into_edits(self) -> Vec<Edit> {
        self.edits
    }

    pub fn record(&mut self, target: EditTarget, message: impl Into<String>) {
        let message = message.into();
        debug!(pass = self.pass, ?target, %message, "edit");
        self.edits.push(Edit {
            pass: self.pass,
            target,
            message,
        });
    }

    pub fn class_target(&self, id: ClassId) -> Option<EditTarget> {
        self.program.class_name(id).map(EditTarget::Class)
    }

    pub fn field_target(&self, id: FieldId) -> Option<EditTarget> {
        let (owner, name) = self
            .program
            .field(id)
            .map(|field| (field.owner(), field.name().to_string()))?;
        Some(EditTarget::Field {
            owner: self.program.class_name(owner)?,
            name,
        })
    }

    pub fn method_target(&self, id: MethodId) -> Option<EditTarget> {
        let (owner, name, descriptor) = self.program.method(id).map(|method| {
            (
                method.owner(),
                method.name().to_string(),
                method.descriptor().to_string(),
            )
        })?;
        Some(EditTarget::Method {
            owner: self.program.class_name(owner)?,
            name,
            descriptor,
        })
    }

    fn annotate_changes(&self) -> bool {
        self.program.settings().annotate_changes
    }

    pub fn rename_class(&mut self, id: ClassId, new_name: &str) -> Result<(), MutationError> {
        let target = self.class_target(id).ok_or(MutationError::UnknownClass(id))?;
        mutate::rename_class(self.program, id, new_name)?;
        if let EditTarget::Class(old) = &target {
            if self.annotate_changes() {
                self.program
                    .annotate_class(id, "Renamed", vec![("from".into(), old.as_str().into())]);
            }
        }
        self.record(target, format!("renamed to {new_name}"));
        Ok(())
    }

    pub fn rename_field(&mut self, id: FieldId, new_name: &str) -> Result<(), MutationError> {
        let target = self.field_target(id).ok_or(MutationError::UnknownField(id))?;
        mutate::rename_field(self.program, id, new_name)?;
        if let EditTarget::Field { name, .. } = &target {
            if self.annotate_changes() {
                self.program
                    .annotate_field(id, "Renamed", vec![("from".into(), name.as_str().into())]);
            }
        }
        self.record(target, format!("renamed to {new_name}"));
        Ok(())
    }

    pub fn rename_method(&mut self, id: MethodId, new_name: &str) -> Result<(), MutationError> {
        let target = self.method_target(id).ok_or(MutationError::UnknownMethod(id))?;
        mutate::rename_method(self.program, id, new_name)?;
        if let EditTarget::Method { name, .. } = &target {
            if self.annotate_changes() {
                self.program
                    .annotate_method(id, "Renamed", vec![("from".into(), name.as_str().into())]);
            }
        }
        self.record(target, format!("renamed to {new_name}"));
        Ok(())
    }

    pub fn delete_field(&mut self, id: FieldId) -> Result<(), MutationError> {
        let target = self.field_target(id).ok_or(MutationError::UnknownField(id))?;
        mutate::delete_field(self.program, id)?;
        self.record(target, "deleted");
        Ok(())
    }

    pub fn delete_method(&mut self, id: MethodId) -> Result<(), MutationError> {
        let target = self.method_target(id).ok_or(MutationError::UnknownMethod(id))?;
        mutate::delete_method(self.program, id)?;
        self.record(target, "deleted");
        Ok(())
    }

    pub fn move_field(&mut self, id: FieldId, destination: ClassId) -> Result<(), MutationError> {
        let target = self.field_target(id).ok_or(MutationError::UnknownField(id))?;
        let to = self
            .program
            .class_name(destination)
            .ok_or(MutationError::UnknownClass(destination))?;
        mutate::move_field(self.program, id, destination)?;
        if let EditTarget::Field { owner, .. } = &target {
            if self.annotate_changes() {
                self.program.annotate_field(id, "Moved", moved(owner, &to));
            }
        }
        self.record(target, format!("moved to {to}"));
        Ok(())
    }

    pub fn move_method(&mut self, id: MethodId, destination: ClassId) -> Result<(), MutationError> {
        let target = self.method_target(id).ok_or(MutationError::UnknownMethod(id))?;
        let to = self
            .program
            .class_name(destination)
            .ok_or(MutationError::UnknownClass(destination))?;
        mutate::move_method(self.program, id, destination)?;
        if let EditTarget::Method { owner, .. } = &target {
            if self.annotate_changes() {
                self.program.annotate_method(id, "Moved", moved(owner, &to));
            }
        }
        self.record(target, format!("moved to {to}"));
        Ok(())
    }
}

fn moved(from: &str, to: &str) -> Vec<(String, AnnotationValue)> {
    vec![("from".into(), from.into()), ("to".into(), to.into())]
}

/// Outcome of one pass run.
#[derive(Clone, Debug)]
pub struct PassSummary {
    pub id: &'static str,
    pub nodes: usize,
    pub edits: usize,
    pub elapsed: Duration,
}

/// Everything a pipeline run produced.
#[derive(Clone, Debug, Default)]
pub struct PipelineReport {
    pub summaries: Vec<PassSummary>,
    pub edits: Vec<Edit>,
}

/// Ordered list of passes, each run to completion before the next starts.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&mut self, program: &Program) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        for pass in &mut self.passes {
            let metadata = pass.metadata();
            let started_at = Instant::now();
            let mut context = PassContext::new(program, metadata.id);
            let mut nodes = 0;
            for node in Nodes::new(program, metadata.kind) {
                nodes += 1;
                pass.visit(&mut context, node)
                    .with_context(|| format!("pass {} failed on {node:?}", metadata.id))?;
            }
            pass.finish(&mut context)
                .with_context(|| format!("pass {} failed to finish", metadata.id))?;

            let edits = context.into_edits();
            let summary = PassSummary {
                id: metadata.id,
                nodes,
                edits: edits.len(),
                elapsed: started_at.elapsed(),
            };
            info!(
                pass = summary.id,
                nodes = summary.nodes,
                edits = summary.edits,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "{} processed {} nodes in {:?}",
                metadata.name,
                nodes,
                summary.elapsed
            );
            report.summaries.push(summary);
            report.edits.extend(edits);
        }
        Ok(report)
    }
}

/// Pass built from a closure.
pub struct OneOff<F> {
    id: &'static str,
    kind: NodeKind,
    visit: F,
}

impl<F> Pass for OneOff<F>
where
    F: FnMut(&mut PassContext<'_>, Node) -> Result<()> + Send,
{
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: self.id,
            name: self.id,
            description: "closure pass",
            kind: self.kind,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        (self.visit)(context, node)
    }
}

/// Wraps a closure as a pass over `kind` nodes.
pub fn one_off<F>(id: &'static str, kind: NodeKind, visit: F) -> OneOff<F>
where
    F: FnMut(&mut PassContext<'_>, Node) -> Result<()> + Send,
{
    OneOff { id, kind, visit }
}

/// Ids accepted by [`by_name`], in the order the command line runs them by default.
pub const DEFAULT_PASSES: &[&str] = &[
    rename::CLASS_RENAMER,
    rename::FIELD_RENAMER,
    rename::METHOD_RENAMER,
    remove::UNUSED_FIELD_REMOVER,
    remove::UNUSED_METHOD_REMOVER,
    remove::ABSTRACT_METHOD_REMOVER,
    inline::STATIC_FIELD_INLINER,
    jumps::JUMP_OPTIMIZER,
    dead_code::DEAD_CODE_REMOVER,
];

/// Builds a default pass by id.
pub fn by_name(id: &str) -> Option<Box<dyn Pass>> {
    let pass: Box<dyn Pass> = match id {
        rename::CLASS_RENAMER => Box::new(rename::ClassRenamer::default()),
        rename::FIELD_RENAMER => Box::new(rename::FieldRenamer::default()),
        rename::METHOD_RENAMER => Box::new(rename::MethodRenamer::default()),
        remove::UNUSED_FIELD_REMOVER => Box::new(remove::UnusedFieldRemover::default()),
        remove::UNUSED_METHOD_REMOVER => Box::new(remove::UnusedMethodRemover::default()),
        remove::ABSTRACT_METHOD_REMOVER => Box::new(remove::AbstractMethodRemover::default()),
        inline::STATIC_FIELD_INLINER => Box::new(inline::StaticFieldInliner),
        jumps::JUMP_OPTIMIZER => Box::new(jumps::JumpOptimizer),
        dead_code::DEAD_CODE_REMOVER => Box::new(dead_code::DeadCodeRemover),
        _ => return None,
    };
    Some(pass)
}

const OBJECT: &str = "java/lang/Object";

/// Methods declared by `java.lang.Object` that subclasses may override.
const OBJECT_METHODS: &[(&str, &str)] = &[
    ("equals", "(Ljava/lang/Object;)Z"),
    ("hashCode", "()I"),
    ("toString", "()Ljava/lang/String;"),
    ("clone", "()Ljava/lang/Object;"),
    ("finalize", "()V"),
];

/// Whether renaming or deleting `id` could break dispatch: it overrides or is overridden by a
/// method of a scanned class, overrides an `Object` method, or its class extends something that
/// was not scanned.
pub fn in_override_family(program: &Program, id: MethodId) -> bool {
    let Some((owner, name, descriptor, is_static)) = program.method(id).map(|method| {
        (
            method.owner(),
            method.name().to_string(),
            method.descriptor().to_string(),
            method.is_static(),
        )
    }) else {
        return false;
    };
    if is_static || name.starts_with('<') {
        return false;
    }
    if OBJECT_METHODS.contains(&(name.as_str(), descriptor.as_str())) {
        return true;
    }

    let (ancestors, external) = ancestors(program, owner);
    if external {
        return true;
    }
    let declares = |class: ClassId| {
        program
            .class_name(class)
            .and_then(|owner| program.find_method(&owner, &name, &descriptor))
            .is_some()
    };
    ancestors.into_iter().any(declares) || descendants(program, owner).into_iter().any(declares)
}

/// Loaded supertypes of `class`, and whether any supertype other than `Object` is missing.
fn ancestors(program: &Program, class: ClassId) -> (BTreeSet<ClassId>, bool) {
    let mut seen = BTreeSet::new();
    let mut external = false;
    let mut queue = vec![class];
    while let Some(current) = queue.pop() {
        let Some(parents) = program.class(current).map(|class| {
            class
                .super_name()
                .into_iter()
                .map(str::to_string)
                .chain(class.interfaces().iter().cloned())
                .collect::<Vec<_>>()
        }) else {
            continue;
        };
        for parent in parents {
            match program.find_class(&parent) {
                Some(id) if seen.insert(id) => queue.push(id),
                Some(_) => {}
                None if parent != OBJECT => external = true,
                None => {}
            }
        }
    }
    (seen, external)
}

fn descendants(program: &Program, class: ClassId) -> BTreeSet<ClassId> {
    let mut seen = BTreeSet::new();
    let mut queue = vec![class];
    while let Some(current) = queue.pop() {
        let Some(children) = program.class(current).map(|class| {
            class
                .sub_classes()
                .iter()
                .chain(class.implemented_by())
                .copied()
                .collect::<Vec<_>>()
        }) else {
            continue;
        };
        for child in children {
            if seen.insert(child) {
                queue.push(child);
            }
        }
    }
    seen
}

/// `public static void main(String[])`.
pub fn is_entry_point(program: &Program, id: MethodId) -> bool {
    program.method(id).is_some_and(|method| {
        method.name() == "main"
            && method.descriptor() == "([Ljava/lang/String;)V"
            && method.is_static()
    })
}
