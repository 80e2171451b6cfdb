pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloBackend;

use anyhow::{anyhow, Result};
use std::path::Path;

/// Read class labels from a text file, one label per line, in class-id order.
///
/// Blank lines are skipped; surrounding whitespace is trimmed.
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read class names {}: {}", path.display(), e))?;
    let names: Vec<String> = raw
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect();
    if names.is_empty() {
        return Err(anyhow!("class name file {} is empty", path.display()));
    }
    Ok(names)
}
