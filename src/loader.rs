//! Top-level entry point: scan an input, then run passes over what was loaded.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::ScanError;
use crate::passes::{Pass, Pipeline, PipelineReport};
use crate::program::Program;
use crate::scan::{self, ScanOutput};
use crate::settings::Settings;

/// Owns one [`Program`] and the passes to run over it.
///
/// ```no_run
/// use bytetwist::loader::Loader;
/// use bytetwist::passes::by_name;
/// use bytetwist::settings::Settings;
///
/// let mut loader = Loader::new(Settings::default());
/// loader.set_input("app.jar");
/// loader.scan()?;
/// if let Some(pass) = by_name("dead-code-remover") {
///     loader.add_pass(pass);
/// }
/// let report = loader.launch()?;
/// println!("{} edits", report.edits.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Loader {
    program: Program,
    input: Option<PathBuf>,
    scan: Option<ScanOutput>,
    pipeline: Pipeline,
}

impl Loader {
    pub fn new(settings: Settings) -> Self {
        Self {
            program: Program::new(settings),
            input: None,
            scan: None,
            pipeline: Pipeline::new(),
        }
    }

    pub fn set_input(&mut self, input: impl AsRef<Path>) {
        self.input = Some(input.as_ref().to_path_buf());
    }

    /// Scans the input into the program. Scanning again starts from an empty program.
    pub fn scan(&mut self) -> Result<&ScanOutput, ScanError> {
        let input = self.input.as_deref().ok_or(ScanError::NoInput)?;
        if self.scan.is_some() {
            self.program.clear();
        }
        let output = scan::scan(&self.program, input)?;
        Ok(self.scan.insert(output))
    }

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.pipeline.add(pass);
    }

    /// Runs every added pass, in order, over the scanned program.
    pub fn launch(&mut self) -> Result<PipelineReport> {
        if self.scan.is_none() {
            return Err(ScanError::Uninitialized.into());
        }
        self.pipeline.run(&self.program)
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn scan_output(&self) -> Option<&ScanOutput> {
        self.scan.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::opcodes;
    use crate::passes::{Node, NodeKind, one_off};

    #[test]
    fn configuration_errors_surface_to_the_caller() {
        let mut loader = Loader::new(Settings::default());
        assert!(matches!(loader.scan(), Err(ScanError::NoInput)));

        let error = loader.launch().expect_err("not scanned");
        assert!(matches!(
            error.downcast_ref::<ScanError>(),
            Some(ScanError::Uninitialized)
        ));
    }

    #[test]
    fn scan_then_launch_runs_passes_over_loaded_classes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bytes = ClassSpec::new("demo/Main")
            .method(
                MethodSpec::new("main", "([Ljava/lang/String;)V")
                    .statik()
                    .op(opcodes::RETURN),
            )
            .bytes();
        fs::write(dir.path().join("Main.class"), bytes).expect("write");

        let mut loader = Loader::new(Settings::default());
        loader.set_input(dir.path());
        assert_eq!(loader.scan().expect("scan").class_count(), 1);
        // A second scan replaces the first.
        assert_eq!(loader.scan().expect("rescan").class_count(), 1);
        assert_eq!(loader.program().class_count(), 1);

        loader.add_pass(Box::new(one_off("count", NodeKind::Method, |context, node| {
            if let Node::Method(id) = node {
                if let Some(target) = context.method_target(id) {
                    context.record(target, "seen");
                }
            }
            Ok(())
        })));
        let report = loader.launch().expect("launch");
        assert_eq!(report.edits.len(), 1);
        assert_eq!(report.summaries[0].nodes, 1);
    }
}
