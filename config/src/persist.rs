//! Writes back to the config file.
//!
//! Edits go through `toml_edit` so user comments and formatting survive, and
//! the result is written atomically.

use std::fs;
use std::io;
use std::path::Path;

use gx_types::Warning;
use toml_edit::{Array, DocumentMut, Item, Table};

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Load `path` (or an empty document), apply `edit`, and write it back if
/// `edit` reports a change.
fn edit_config(
    path: &Path,
    edit: impl FnOnce(&mut DocumentMut) -> io::Result<bool>,
) -> io::Result<bool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    gx_utils::recover_bak_file(path);

    let content = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let mut doc = content
        .parse::<DocumentMut>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if !edit(&mut doc)? {
        return Ok(false);
    }

    gx_utils::atomic_write(path, doc.to_string().as_bytes())?;
    Ok(true)
}

/// Add `warning` to `ignored_warnings` unless it is already there.
///
/// Returns whether the file changed.
pub fn persist_ignored_warning(path: &Path, warning: Warning) -> io::Result<bool> {
    let id = warning.id();
    let changed = edit_config(path, |doc| {
        let item = doc
            .entry("ignored_warnings")
            .or_insert_with(|| toml_edit::value(Array::new()));
        let Some(array) = item.as_array_mut() else {
            return Err(invalid_data("ignored_warnings must be an array"));
        };
        if array.iter().any(|v| v.as_str() == Some(id)) {
            return Ok(false);
        }
        array.push(id);
        Ok(true)
    })?;
    if changed {
        tracing::info!(warning = id, path = %path.display(), "Warning dismissed");
    }
    Ok(changed)
}

/// Record `executable` as `[python].active`.
pub fn persist_active_interpreter(path: &Path, executable: &Path) -> io::Result<()> {
    let value = executable.to_string_lossy().into_owned();
    edit_config(path, |doc| {
        if !doc.contains_key("python") {
            doc["python"] = Item::Table(Table::new());
        }
        let Some(table) = doc["python"].as_table_mut() else {
            return Err(invalid_data("[python] must be a table"));
        };
        if table.get("active").and_then(Item::as_str) == Some(value.as_str()) {
            return Ok(false);
        }
        table["active"] = toml_edit::value(value.as_str());
        Ok(true)
    })?;
    tracing::debug!(executable = %executable.display(), "Active interpreter persisted");
    Ok(())
}
