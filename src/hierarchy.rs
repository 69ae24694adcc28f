//! Hierarchy Linker: `sub_classes` and `implemented_by` from super and interface names.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::ir::ClassId;
use crate::program::Program;

/// Rebuilds every class's `sub_classes` and `implemented_by` from scratch.
///
/// Links are established by name equality; a super or interface name that was never scanned
/// links nothing.
pub fn link_hierarchy(program: &Program) {
    let classes = program.class_ids();
    classes.par_iter().for_each(|id| {
        program.update_class(*id, |class| {
            class.sub_classes.clear();
            class.implemented_by.clear();
        });
    });
    classes.par_iter().for_each(|id| link_class(program, *id));
}

/// Adds `id` to its superclass's `sub_classes` and to each interface's `implemented_by`.
pub fn link_class(program: &Program, id: ClassId) {
    let Some((super_name, interfaces)) = program
        .class(id)
        .map(|class| (class.super_name.clone(), class.interfaces.clone()))
    else {
        return;
    };
    if let Some(parent) = super_name.and_then(|name| program.find_class(&name)) {
        program.update_class(parent, |class| class.sub_classes.insert(id));
    }
    for interface in interfaces {
        if let Some(parent) = program.find_class(&interface) {
            program.update_class(parent, |class| class.implemented_by.insert(id));
        }
    }
}

/// Removes `id` from its parents' link sets.
pub(crate) fn unlink_class(program: &Program, id: ClassId) {
    let Some((super_name, interfaces)) = program
        .class(id)
        .map(|class| (class.super_name.clone(), class.interfaces.clone()))
    else {
        return;
    };
    if let Some(parent) = super_name.and_then(|name| program.find_class(&name)) {
        program.update_class(parent, |class| class.sub_classes.remove(&id));
    }
    for interface in interfaces {
        if let Some(parent) = program.find_class(&interface) {
            program.update_class(parent, |class| class.implemented_by.remove(&id));
        }
    }
}

/// Re-links a class whose name just changed: its own parent links, plus `sub_classes` and
/// `implemented_by` rebuilt from the classes that now name it.
pub(crate) fn relink_class(program: &Program, id: ClassId) {
    link_class(program, id);
    let Some(name) = program.class_name(id) else {
        return;
    };
    let mut sub_classes = BTreeSet::new();
    let mut implemented_by = BTreeSet::new();
    for other in program.class_ids() {
        let Some((extends, implements)) = program.class(other).map(|class| {
            (
                class.super_name.as_deref() == Some(name.as_str()),
                class.interfaces.iter().any(|interface| *interface == name),
            )
        }) else {
            continue;
        };
        if extends {
            sub_classes.insert(other);
        }
        if implements {
            implemented_by.insert(other);
        }
    }
    program.update_class(id, |class| {
        class.sub_classes = sub_classes;
        class.implemented_by = implemented_by;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ClassSpec;

    #[test]
    fn subclasses_and_implementors_are_symmetric() {
        let program = Program::default();
        let runnable = ClassSpec::new("Task").interface().load(&program);
        let base = ClassSpec::new("Base").load(&program);
        let child = ClassSpec::new("Child")
            .extends("Base")
            .implements("Task")
            .load(&program);
        let orphan = ClassSpec::new("Orphan").extends("lib/Missing").load(&program);

        link_hierarchy(&program);

        for id in program.class_ids() {
            let class = program.class(id).expect("class");
            let Some(super_name) = class.super_name().map(str::to_string) else {
                continue;
            };
            drop(class);
            if let Some(parent) = program.find_class(&super_name) {
                assert!(program.class(parent).expect("parent").sub_classes().contains(&id));
                assert_eq!(program.super_class(id), Some(parent));
            }
        }
        assert!(program.class(base).expect("base").sub_classes().contains(&child));
        assert!(
            program
                .class(runnable)
                .expect("interface")
                .implemented_by()
                .contains(&child)
        );
        assert_eq!(program.super_class(orphan), None);
    }

    #[test]
    fn relinking_is_idempotent() {
        let program = Program::default();
        let base = ClassSpec::new("Base").load(&program);
        ClassSpec::new("A").extends("Base").load(&program);
        ClassSpec::new("B").extends("Base").load(&program);

        link_hierarchy(&program);
        link_hierarchy(&program);

        assert_eq!(program.class(base).expect("base").sub_classes().len(), 2);
    }
}
