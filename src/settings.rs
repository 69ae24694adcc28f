use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Run-wide options, loaded from a JSON file. Every field may be omitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Worker threads for the scan phases; `None` uses one per core.
    pub worker_threads: Option<usize>,
    /// Annotate each analyzed method with `Complexity(Blocks, Edges)`.
    pub annotate_method_complexity: bool,
    /// Annotate each method with `TryCatchs(number)`.
    pub annotate_try_catch_count: bool,
    /// Annotate each method with one `LocalVariable(name, References)` per named local.
    pub annotate_local_variables: bool,
    /// Let renaming and moving passes annotate what they changed.
    pub annotate_changes: bool,
    /// Ignore LocalVariableTable and LocalVariableTypeTable while decoding.
    pub skip_debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_threads: None,
            annotate_method_complexity: false,
            annotate_try_catch_count: false,
            annotate_local_variables: false,
            annotate_changes: false,
            skip_debug: true,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"annotate_method_complexity": true}"#).expect("parse");
        assert!(settings.annotate_method_complexity);
        assert!(settings.skip_debug);
        assert_eq!(settings.worker_threads, None);
    }

    #[test]
    fn load_reports_unknown_keys() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"worker_threads": 2, "colour": "blue"}"#).expect("write");
        let error = Settings::load(&path).expect_err("unknown key");
        assert!(format!("{error:#}").contains("colour"));

        fs::write(&path, r#"{"worker_threads": 2, "skip_debug": false}"#).expect("write");
        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.worker_threads, Some(2));
        assert!(!settings.skip_debug);
    }
}
