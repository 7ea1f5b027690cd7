// Model library registry
//
// Owns one opened library and every model handle built from it. Teardown is
// two-phase and explicit: all handles (and their device buffers) are dropped
// first, then the library is unloaded. The same order applies when `open`
// fails part-way through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::manifest::list_models;
use super::model::ModelHandle;
use super::platform::{LibraryHandle, LoadMode, NativeLibrary, NativeLoader, PlatformLoader};
use super::search::locate_library;
use crate::errors::{LibraryError, Result};

/// Options controlling how a library is located, opened and provisioned
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Directories searched before the fallback locations
    pub search_paths: Vec<PathBuf>,
    /// Symbol binding mode for the native loader
    pub load_mode: LoadMode,
    /// Rows of device buffer allocated per model
    pub batch_capacity: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            load_mode: LoadMode::default(),
            batch_capacity: 1,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    pub fn batch_capacity(mut self, rows: usize) -> Self {
        self.batch_capacity = rows;
        self
    }
}

/// A loaded model library and the models it declares
pub struct ModelLibrary<H: LibraryHandle = NativeLibrary> {
    basename: String,
    path: PathBuf,
    models: HashMap<String, ModelHandle>,
    /// `None` once torn down
    library: Option<H>,
}

impl ModelLibrary<NativeLibrary> {
    /// Open `basename` with the native loader, searching `search_path` first
    pub fn open(basename: &str, search_path: Option<&Path>) -> Result<Self> {
        let mut options = OpenOptions::default();
        if let Some(path) = search_path {
            options.search_paths.push(path.to_path_buf());
        }
        Self::open_with_options(basename, &options)
    }

    /// Open `basename` with the native loader and explicit options
    pub fn open_with_options(basename: &str, options: &OpenOptions) -> Result<Self> {
        Self::open_with(&NativeLoader::new(options.load_mode), basename, options)
    }
}

impl<H: LibraryHandle> ModelLibrary<H> {
    /// Open `basename` through `loader` and construct every declared model
    ///
    /// Either every model is constructed or none is: on failure, models
    /// already built are dropped in reverse order, the library is unloaded,
    /// and the error is returned.
    pub fn open_with<L>(loader: &L, basename: &str, options: &OpenOptions) -> Result<Self>
    where
        L: PlatformLoader<Handle = H>,
    {
        let path = locate_library(basename, &options.search_paths)?;
        let library = loader.open(basename, &path)?;

        let names = match list_models(&library, basename) {
            Ok(names) => names,
            Err(e) => {
                unload_after_failure(library, basename);
                return Err(e);
            }
        };

        let mut built: Vec<ModelHandle> = Vec::with_capacity(names.len());
        for name in &names {
            match ModelHandle::new(&library, basename, name, options.batch_capacity) {
                Ok(model) => built.push(model),
                Err(e) => {
                    warn!(basename, model = %name, error = %e, "Model construction failed");
                    while let Some(model) = built.pop() {
                        drop(model);
                    }
                    unload_after_failure(library, basename);
                    return Err(e);
                }
            }
        }

        info!(
            basename,
            path = %path.display(),
            "Found {} model{}: {}",
            names.len(),
            if names.len() == 1 { "" } else { "s" },
            names.join(", ")
        );

        let models = built
            .into_iter()
            .map(|model| (model.name().to_string(), model))
            .collect();

        Ok(Self {
            basename: basename.to_string(),
            path,
            models,
            library: Some(library),
        })
    }

    /// Logical name the library was opened with
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Resolved path of the library file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the library declares `name`
    pub fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Get a model by name
    pub fn get_model(&self, name: &str) -> Result<&ModelHandle> {
        self.models.get(name).ok_or_else(|| LibraryError::NotFound {
            model: name.to_string(),
        })
    }

    /// Names of all models, sorted
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over all model handles
    pub fn models(&self) -> impl Iterator<Item = &ModelHandle> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Release every model, then unload the library
    ///
    /// Reports unload errors that dropping the registry would only log.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let Some(library) = self.library.take() else {
            return Ok(());
        };

        // Frees device memory through routines that live in `library`
        self.models.clear();
        library.close()?;

        info!(basename = %self.basename, "Unloaded model library");
        Ok(())
    }
}

impl<H: LibraryHandle> Drop for ModelLibrary<H> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(basename = %self.basename, error = %e, "Failed to unload model library");
        }
    }
}

impl<H: LibraryHandle> std::fmt::Debug for ModelLibrary<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLibrary")
            .field("basename", &self.basename)
            .field("path", &self.path)
            .field("models", &self.model_names())
            .field("loaded", &self.library.is_some())
            .finish()
    }
}

fn unload_after_failure<H: LibraryHandle>(library: H, basename: &str) {
    if let Err(e) = library.close() {
        warn!(basename, error = %e, "Failed to unload library after open error");
    }
}
