// Model descriptor table
// Reads the list of model names a generated library declares via `model_info`.

use std::collections::HashSet;
use std::ffi::{c_char, c_int, CStr};
use tracing::warn;

use super::platform::LibraryHandle;
use super::symbols::{resolve_manifest, ManifestFn, MODEL_INFO_SYMBOL};
use crate::errors::{LibraryError, Result};

/// List the models declared by an opened library
///
/// The names are copied into owned strings before returning; the array the
/// library hands out is only valid for the duration of the call.
pub fn list_models<H: LibraryHandle>(handle: &H, basename: &str) -> Result<Vec<String>> {
    let manifest = resolve_manifest(handle).map_err(|e| LibraryError::IncompatibleLibrary {
        basename: basename.to_string(),
        reason: format!("missing manifest function '{}': {}", MODEL_INFO_SYMBOL, e),
    })?;

    let names = read_manifest(manifest).map_err(|reason| LibraryError::IncompatibleLibrary {
        basename: basename.to_string(),
        reason,
    })?;

    if names.is_empty() {
        warn!(basename, "Model library declares no models");
    }
    Ok(names)
}

fn read_manifest(manifest: ManifestFn) -> std::result::Result<Vec<String>, String> {
    let mut names: *const *const c_char = std::ptr::null();
    let mut count: c_int = 0;
    unsafe { manifest(&mut names, &mut count) };

    if count < 0 {
        return Err(format!("manifest reported a negative model count ({})", count));
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    if names.is_null() {
        return Err(format!("manifest reported {} models but no name array", count));
    }

    let mut seen = HashSet::with_capacity(count as usize);
    let mut models = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let entry = unsafe { *names.add(i) };
        if entry.is_null() {
            return Err(format!("manifest entry {} is null", i));
        }
        let name = unsafe { CStr::from_ptr(entry) }
            .to_str()
            .map_err(|_| format!("manifest entry {} is not valid UTF-8", i))?
            .to_owned();
        if name.is_empty() {
            return Err(format!("manifest entry {} is empty", i));
        }
        if !seen.insert(name.clone()) {
            return Err(format!("model '{}' declared more than once", name));
        }
        models.push(name);
    }
    Ok(models)
}
