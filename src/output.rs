//! Output passes: write every live class back out through a [`ClassEncoder`].
//!
//! A class that fails to encode is logged and left out; the rest are still written.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::encode::{ClassEncoder, ClassWriter};
use crate::passes::{EditTarget, Node, NodeKind, Pass, PassContext, PassMetadata};

pub const JAR_OUTPUT: &str = "jar-output";
pub const CLASS_OUTPUT: &str = "class-output";

/// Encodes the class behind `node`, returning its entry name (`pkg/Name.class`) and bytes.
fn encode_node(
    encoder: &dyn ClassEncoder,
    context: &PassContext<'_>,
    node: Node,
) -> Option<(String, Vec<u8>)> {
    let Node::Class(id) = node else {
        return None;
    };
    let program = context.program();
    let name = program.class_name(id)?;
    match encoder.encode(program, id) {
        Ok(bytes) => Some((format!("{name}.class"), bytes)),
        Err(error) => {
            warn!(class = %name, %error, "class not written");
            None
        }
    }
}

/// Writes all classes into one jar, entries sorted by name.
pub struct JarOutputPass {
    path: PathBuf,
    encoder: Box<dyn ClassEncoder>,
    entries: BTreeMap<String, Vec<u8>>,
}

impl JarOutputPass {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_encoder(path, Box::new(ClassWriter))
    }

    pub fn with_encoder(path: impl Into<PathBuf>, encoder: Box<dyn ClassEncoder>) -> Self {
        Self {
            path: path.into(),
            encoder,
            entries: BTreeMap::new(),
        }
    }
}

impl Pass for JarOutputPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: JAR_OUTPUT,
            name: "Jar output",
            description: "Writes the transformed classes into a jar file",
            kind: NodeKind::Class,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        if let Some((name, bytes)) = encode_node(self.encoder.as_ref(), context, node) {
            self.entries.insert(name, bytes);
        }
        Ok(())
    }

    fn finish(&mut self, context: &mut PassContext<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = fs::File::create(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        let mut jar = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, bytes) in &self.entries {
            jar.start_file(name.as_str(), options)
                .with_context(|| format!("failed to add {name} to {}", self.path.display()))?;
            jar.write_all(bytes)
                .with_context(|| format!("failed to write {name} to {}", self.path.display()))?;
        }
        jar.finish()
            .with_context(|| format!("failed to finish {}", self.path.display()))?;

        let count = self.entries.len();
        info!(path = %self.path.display(), classes = count, "jar written");
        context.record(
            EditTarget::File(self.path.to_string_lossy().to_string()),
            format!("wrote {count} classes"),
        );
        self.entries.clear();
        Ok(())
    }
}

/// Writes each class to `<dir>/<internal name>.class`.
pub struct ClassOutputPass {
    dir: PathBuf,
    encoder: Box<dyn ClassEncoder>,
    written: usize,
}

impl ClassOutputPass {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_encoder(dir, Box::new(ClassWriter))
    }

    pub fn with_encoder(dir: impl Into<PathBuf>, encoder: Box<dyn ClassEncoder>) -> Self {
        Self {
            dir: dir.into(),
            encoder,
            written: 0,
        }
    }
}

impl Pass for ClassOutputPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: CLASS_OUTPUT,
            name: "Class output",
            description: "Writes the transformed classes as class files under a directory",
            kind: NodeKind::Class,
        }
    }

    fn visit(&mut self, context: &mut PassContext<'_>, node: Node) -> Result<()> {
        let Some((name, bytes)) = encode_node(self.encoder.as_ref(), context, node) else {
            return Ok(());
        };
        let path = self.dir.join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self, context: &mut PassContext<'_>) -> Result<()> {
        info!(dir = %self.dir.display(), classes = self.written, "class files written");
        context.record(
            EditTarget::File(self.dir.to_string_lossy().to_string()),
            format!("wrote {} classes", self.written),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use zip::ZipArchive;

    use crate::error::EncodeError;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::ir::ClassId;
    use crate::mutate;
    use crate::opcodes;
    use crate::passes::Pipeline;
    use crate::program::Program;
    use crate::scan;

    fn sample(program: &Program) {
        ClassSpec::new("demo/a")
            .method(
                MethodSpec::new("answer", "()I")
                    .statik()
                    .int(opcodes::BIPUSH, 42)
                    .op(opcodes::IRETURN),
            )
            .load(program);
        ClassSpec::new("demo/Other").load(program);
    }

    #[test]
    fn jar_output_writes_renamed_classes_that_scan_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let jar_path = dir.path().join("out").join("demo.jar");
        let program = Program::default();
        sample(&program);
        let class = program.find_class("demo/a").expect("class");
        mutate::rename_class(&program, class, "demo/Answer").expect("rename");

        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(JarOutputPass::new(&jar_path)));
        let report = pipeline.run(&program).expect("run");
        assert_eq!(report.edits.len(), 1);

        let file = fs::File::open(&jar_path).expect("open jar");
        let mut archive = ZipArchive::new(file).expect("read jar");
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["demo/Answer.class", "demo/Other.class"]);
        let mut bytes = Vec::new();
        archive
            .by_name("demo/Answer.class")
            .expect("entry")
            .read_to_end(&mut bytes)
            .expect("read entry");
        assert_eq!(&bytes[..4], &[0xca, 0xfe, 0xba, 0xbe]);

        let reloaded = Program::default();
        let output = scan::scan(&reloaded, &jar_path).expect("scan");
        assert_eq!(output.class_count(), 2);
        assert!(reloaded.find_method("demo/Answer", "answer", "()I").is_some());
    }

    struct Failing;

    impl ClassEncoder for Failing {
        fn encode(&self, _program: &Program, class: ClassId) -> Result<Vec<u8>, EncodeError> {
            Err(EncodeError::UnknownClass(class))
        }
    }

    #[test]
    fn class_output_skips_classes_that_fail_to_encode() {
        let dir = tempfile::tempdir().expect("temp dir");
        let program = Program::default();
        sample(&program);

        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(ClassOutputPass::new(dir.path().join("ok"))));
        pipeline.add(Box::new(ClassOutputPass::with_encoder(
            dir.path().join("failing"),
            Box::new(Failing),
        )));
        let report = pipeline.run(&program).expect("run");

        assert!(dir.path().join("ok/demo/a.class").is_file());
        assert!(dir.path().join("ok/demo/Other.class").is_file());
        assert!(!dir.path().join("failing").exists());
        assert_eq!(report.edits[0].message, "wrote 2 classes");
        assert_eq!(report.edits[1].message, "wrote 0 classes");
    }
}
