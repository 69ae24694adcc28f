//! Two-pass scan: collect class bytes, decode them into the program, then link the hierarchy,
//! resolve references and build control flow graphs.
//!
//! Each phase is a parallel loop on a bounded rayon pool and the end of the loop is the barrier
//! before the next phase. A class that fails to decode, or a method whose analysis fails, is
//! logged and counted; the rest of the batch carries on.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::cfg;
use crate::decode::decode_class;
use crate::error::ScanError;
use crate::hierarchy;
use crate::ir::ClassId;
use crate::model::ModelBuilder;
use crate::program::Program;
use crate::resolve;

/// Class file bytes and where they came from.
#[derive(Clone, Debug)]
pub struct ClassSource {
    pub origin: String,
    pub bytes: Vec<u8>,
}

/// What a scan loaded, plus the SARIF artifacts describing the input.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub artifacts: Vec<Artifact>,
    /// Classes registered by this scan, in input order.
    pub classes: Vec<ClassId>,
    pub origins: HashMap<ClassId, String>,
    pub decode_failures: usize,
    pub cfg_failures: usize,
}

impl ScanOutput {
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

/// Scans a directory, `.class` file or `.jar` file into `program`.
pub fn scan(program: &Program, input: &Path) -> Result<ScanOutput, ScanError> {
    if !input.exists() {
        return Err(ScanError::InputNotFound(input.to_path_buf()));
    }
    let started_at = Instant::now();
    let mut artifacts = Vec::new();
    let mut sources = Vec::new();
    collect_path(input, true, &mut artifacts, &mut sources)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(program.settings().worker_threads.unwrap_or(0))
        .build()?;
    let skip_debug = program.settings().skip_debug;

    let output = pool.install(|| {
        let decoded: Vec<_> = sources
            .par_iter()
            .map(|source| {
                let mut builder = ModelBuilder::new(program);
                match decode_class(&source.bytes, &mut builder, skip_debug) {
                    Ok(_) => Some((source.origin.clone(), builder.into_classes())),
                    Err(error) => {
                        warn!(origin = %source.origin, %error, "class skipped");
                        None
                    }
                }
            })
            .collect();
        let decode_failures = decoded.iter().filter(|entry| entry.is_none()).count();
        let mut classes = Vec::new();
        let mut origins = HashMap::new();
        for (origin, ids) in decoded.into_iter().flatten() {
            for id in ids {
                classes.push(id);
                origins.insert(id, origin.clone());
            }
        }
        info!(
            classes = classes.len(),
            failures = decode_failures,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "classes decoded"
        );

        hierarchy::link_hierarchy(program);
        let resolved = resolve::resolve_all(program);
        info!(
            resolved,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "references resolved"
        );

        let cfg_failures = cfg::build_all(program);
        info!(
            failures = cfg_failures,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "control flow graphs built"
        );

        ScanOutput {
            artifacts: Vec::new(),
            classes,
            origins,
            decode_failures,
            cfg_failures,
        }
    });

    Ok(ScanOutput {
        artifacts,
        ..output
    })
}

fn collect_path(
    path: &Path,
    is_input: bool,
    artifacts: &mut Vec<Artifact>,
    sources: &mut Vec<ClassSource>,
) -> Result<(), ScanError> {
    if path.is_dir() {
        return collect_dir(path, artifacts, sources);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let roles = if is_input {
        serde_json::to_value(ArtifactRoles::AnalysisTarget)
            .ok()
            .map(|role| vec![role])
    } else {
        None
    };

    match extension {
        "class" => collect_class_file(path, roles, artifacts, sources),
        "jar" => collect_jar_file(path, roles, artifacts, sources),
        _ if is_input => Err(ScanError::Unsupported(path.to_path_buf())),
        _ => Ok(()),
    }
}

fn collect_dir(
    path: &Path,
    artifacts: &mut Vec<Artifact>,
    sources: &mut Vec<ClassSource>,
) -> Result<(), ScanError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|source| read_error(path, source))? {
        let entry = entry.map_err(|source| read_error(path, source))?;
        entries.push(entry.path());
    }

    // Directory listings are sorted so scans are deterministic.
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_dir(&entry, artifacts, sources)?;
        } else {
            collect_path(&entry, false, artifacts, sources)?;
        }
    }

    Ok(())
}

fn collect_class_file(
    path: &Path,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
    sources: &mut Vec<ClassSource>,
) -> Result<(), ScanError> {
    let bytes = fs::read(path).map_err(|source| read_error(path, source))?;
    push_path_artifact(path, roles, bytes.len() as u64, None, artifacts);
    sources.push(ClassSource {
        origin: path_to_uri(path),
        bytes,
    });
    Ok(())
}

fn collect_jar_file(
    path: &Path,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
    sources: &mut Vec<ClassSource>,
) -> Result<(), ScanError> {
    let file = fs::File::open(path).map_err(|source| read_error(path, source))?;
    let jar_len = file
        .metadata()
        .map_err(|source| read_error(path, source))?
        .len();
    let mut archive = ZipArchive::new(file)?;
    let jar_index = push_path_artifact(path, roles, jar_len, None, artifacts);

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive.by_name(&name)?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| read_error(path, source))?;

        let entry_uri = jar_entry_uri(path, &name);
        push_artifact(entry_uri.clone(), entry.size(), Some(jar_index), None, artifacts);
        sources.push(ClassSource {
            origin: entry_uri,
            bytes,
        });
    }

    Ok(())
}

/// Push a path-based artifact and return its index for parent linkage (e.g., JAR entries).
fn push_path_artifact(
    path: &Path,
    roles: Option<Vec<Value>>,
    len: u64,
    parent_index: Option<i64>,
    artifacts: &mut Vec<Artifact>,
) -> i64 {
    push_artifact(path_to_uri(path), len, parent_index, roles, artifacts)
}

fn push_artifact(
    uri: String,
    len: u64,
    parent_index: Option<i64>,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
) -> i64 {
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = match (parent_index, roles) {
        (Some(parent_index), Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .roles(roles)
            .build(),
        (Some(parent_index), None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .build(),
        (None, Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        (None, None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .build(),
    };
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    index
}

fn read_error(path: &Path, source: std::io::Error) -> ScanError {
    ScanError::Read {
        path: PathBuf::from(path),
        source,
    }
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassSpec, MethodSpec};
    use crate::opcodes;
    use crate::settings::Settings;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn caller() -> Vec<u8> {
        ClassSpec::new("demo/Caller")
            .method(
                MethodSpec::new("call", "(Ldemo/Callee;)I")
                    .var(opcodes::ALOAD, 1)
                    .invoke(opcodes::INVOKEVIRTUAL, "demo/Callee", "value", "()I")
                    .op(opcodes::IRETURN),
            )
            .bytes()
    }

    fn callee() -> Vec<u8> {
        ClassSpec::new("demo/Callee")
            .extends("demo/Base")
            .method(MethodSpec::new("value", "()I").op(opcodes::ICONST_1).op(opcodes::IRETURN))
            .bytes()
    }

    fn base() -> Vec<u8> {
        ClassSpec::new("demo/Base").bytes()
    }

    fn program() -> Program {
        Program::new(Settings {
            worker_threads: Some(2),
            ..Settings::default()
        })
    }

    #[test]
    fn scan_links_classes_found_in_nested_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("demo");
        fs::create_dir_all(&nested).expect("create dir");
        fs::write(nested.join("Caller.class"), caller()).expect("write");
        fs::write(nested.join("Callee.class"), callee()).expect("write");
        fs::write(nested.join("Base.class"), base()).expect("write");
        fs::write(nested.join("notes.txt"), b"ignored").expect("write");

        let program = program();
        let output = scan(&program, dir.path()).expect("scan");

        assert_eq!(output.class_count(), 3);
        assert_eq!(output.decode_failures, 0);
        assert_eq!(output.cfg_failures, 0);
        assert_eq!(output.artifacts.len(), 3);

        let value = program
            .find_method("demo/Callee", "value", "()I")
            .expect("value");
        let call = program
            .find_method("demo/Caller", "call", "(Ldemo/Callee;)I")
            .expect("call");
        let invocations = program.method(value).expect("value").invocations().clone();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations.iter().next().map(|at| at.called_from()), Some(call));

        let base = program.find_class("demo/Base").expect("base");
        let callee = program.find_class("demo/Callee").expect("callee");
        assert!(program.class(base).expect("base").sub_classes().contains(&callee));
        assert!(!program.method(call).expect("call").blocks().is_empty());
        assert!(program.consistency_violations().is_empty());
    }

    #[test]
    fn scan_reads_jar_entries_in_name_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let jar_path = dir.path().join("demo.jar");
        let file = fs::File::create(&jar_path).expect("create jar");
        let mut jar = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, bytes) in [
            ("demo/Callee.class", callee()),
            ("demo/Caller.class", caller()),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
        ] {
            jar.start_file(name, options).expect("start entry");
            jar.write_all(&bytes).expect("write entry");
        }
        jar.finish().expect("finish jar");

        let program = program();
        let output = scan(&program, &jar_path).expect("scan");

        assert_eq!(output.class_count(), 2);
        let uris: Vec<_> = output
            .artifacts
            .iter()
            .filter_map(|artifact| artifact.location.as_ref())
            .filter_map(|location| location.uri.clone())
            .collect();
        assert_eq!(uris.len(), 3);
        assert!(uris[0].ends_with("demo.jar"));
        assert!(uris[1].ends_with("!/demo/Callee.class"));
        assert!(uris[2].ends_with("!/demo/Caller.class"));
        let caller = program.find_class("demo/Caller").expect("caller");
        assert_eq!(output.origins.get(&caller), Some(&uris[2]));
    }

    #[test]
    fn malformed_class_is_isolated() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("Bad.class"), b"nope").expect("write");
        fs::write(dir.path().join("Base.class"), base()).expect("write");

        let program = program();
        let output = scan(&program, dir.path()).expect("scan");

        assert_eq!(output.class_count(), 1);
        assert_eq!(output.decode_failures, 1);
        assert!(program.find_class("demo/Base").is_some());
    }

    #[test]
    fn scan_rejects_missing_and_unsupported_inputs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let program = program();

        let missing = dir.path().join("missing.jar");
        assert!(matches!(
            scan(&program, &missing),
            Err(ScanError::InputNotFound(path)) if path == missing
        ));

        let text = dir.path().join("input.txt");
        fs::write(&text, b"text").expect("write");
        assert!(matches!(
            scan(&program, &text),
            Err(ScanError::Unsupported(path)) if path == text
        ));
    }
}
