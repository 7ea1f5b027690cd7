// Error taxonomy and user-friendly diagnostics
//
// `LibraryError` covers every failure the loader, registry and model handles
// can report. The formatting helpers turn those errors into actionable
// messages for the CLI.

use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for library operations
pub type Result<T, E = LibraryError> = std::result::Result<T, E>;

/// Errors raised while opening a model library or using its models
#[derive(Debug, Error)]
pub enum LibraryError {
    /// No file for the basename exists in any searched directory
    #[error("model library '{basename}' not found (searched {} location(s))", .searched.len())]
    LibraryNotFound {
        basename: String,
        searched: Vec<PathBuf>,
    },

    /// The file exists but the native loader rejected it
    #[error("failed to load model library '{basename}' from {}: {message}", .path.display())]
    LoadFailed {
        basename: String,
        path: PathBuf,
        message: String,
    },

    /// A named symbol is not exported by the library
    #[error("symbol '{symbol}' not found: {message}")]
    SymbolNotFound { symbol: String, message: String },

    /// Manifest symbol missing or manifest contents malformed
    #[error("incompatible model library '{basename}': {reason}")]
    IncompatibleLibrary { basename: String, reason: String },

    /// A model is missing one of its required entry points
    #[error("incompatible model '{model}' in library '{basename}': {source}")]
    IncompatibleModel {
        basename: String,
        model: String,
        #[source]
        source: Box<LibraryError>,
    },

    /// Device allocation failed while constructing a model
    #[error("device memory exhausted allocating {elements} elements for model '{model}' in library '{basename}'")]
    ResourceExhausted {
        basename: String,
        model: String,
        elements: usize,
    },

    /// Declared model dimensions are too large to size buffers for
    #[error("declared dimensions {input_dim} -> {output_dim} with batch capacity {batch_capacity} overflow buffer sizes")]
    DimensionOverflow {
        input_dim: u64,
        output_dim: u64,
        batch_capacity: usize,
    },

    /// Query for a model name that the library does not contain
    #[error("model '{model}' not found")]
    NotFound { model: String },

    /// Host buffer does not fit the model's declared dimensions
    #[error("invalid input for model '{model}': {reason}")]
    InvalidInput { model: String, reason: String },

    /// A native entry point reported a failure status
    #[error("model '{model}' failed in '{entry_point}' (status {status})")]
    Evaluation {
        model: String,
        entry_point: String,
        status: i32,
    },

    /// The native loader refused to unload the library
    #[error("failed to unload model library '{basename}': {message}")]
    UnloadFailed { basename: String, message: String },
}

impl LibraryError {
    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LibraryNotFound { .. } => "library_not_found",
            Self::LoadFailed { .. } => "load_failed",
            Self::SymbolNotFound { .. } => "symbol_not_found",
            Self::IncompatibleLibrary { .. } => "incompatible_library",
            Self::IncompatibleModel { .. } => "incompatible_model",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::DimensionOverflow { .. } => "dimension_overflow",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Evaluation { .. } => "evaluation",
            Self::UnloadFailed { .. } => "unload_failed",
        }
    }
}

/// Format a library-not-found error with helpful suggestions
pub fn library_not_found_error(basename: &str, searched: &[PathBuf]) -> String {
    let locations: Vec<String> = searched
        .iter()
        .map(|p| format!("  • {}", p.display()))
        .collect();
    format!(
        "Model library '{}' not found\n\n\
        \x1b[1;33mSearched:\x1b[0m\n{}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Pass the directory that holds the library:\n\
           \x1b[36mmodelkit list {} --path <dir>\x1b[0m\n\n\
        2. Add the directory to the search path:\n\
           \x1b[36mexport MODELKIT_LIBRARY_PATH=<dir>\x1b[0m\n\n\
        3. Add it to ~/.modelkit/config.toml:\n\
           \x1b[36msearch_paths = [\"<dir>\"]\x1b[0m",
        basename,
        locations.join("\n"),
        basename
    )
}

/// Format a load failure with the native loader diagnostic
pub fn load_failed_error(basename: &str, message: &str) -> String {
    format!(
        "Failed to load model library '{}'\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Library built for a different architecture\n\
        • Missing dependency (e.g. CUDA runtime not on the loader path)\n\
        • File is not a shared library\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Inspect the library's dependencies:\n\
           \x1b[36mldd <library>\x1b[0m  (Linux)\n\
           \x1b[36motool -L <library>\x1b[0m  (macOS)",
        basename, message
    )
}

/// Format an incompatible library/model error
pub fn incompatible_error(basename: &str, detail: &str) -> String {
    format!(
        "Model library '{}' is incompatible with this loader\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. List the exported symbols:\n\
           \x1b[36mnm -D <library> | grep model_info\x1b[0m\n\n\
        2. Regenerate the library with a matching code generator version",
        basename, detail
    )
}

/// Render any library error for display on the terminal
pub fn user_message(error: &LibraryError) -> String {
    match error {
        LibraryError::LibraryNotFound { basename, searched } => {
            library_not_found_error(basename, searched)
        }
        LibraryError::LoadFailed {
            basename, message, ..
        } => load_failed_error(basename, message),
        LibraryError::IncompatibleLibrary { basename, .. }
        | LibraryError::IncompatibleModel { basename, .. } => {
            incompatible_error(basename, &error.to_string())
        }
        other => other.to_string(),
    }
}

/// Machine-readable error report for `--json` output
pub fn error_json(error: &LibraryError) -> Value {
    json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
}
