// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::library::{LoadMode, OpenOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directories searched for model libraries before the fallbacks
    pub search_paths: Vec<PathBuf>,

    /// Symbol binding mode for the native loader (default: now)
    pub load_mode: LoadMode,

    /// Rows of device buffer allocated per model (default: 1)
    pub batch_capacity: usize,

    /// Enable debug-level logging
    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            load_mode: LoadMode::Now,
            batch_capacity: 1,
            debug_logging: false,
        }
    }
}

impl Config {
    /// Registry options for this configuration, with `extra_paths` searched first
    pub fn open_options(&self, extra_paths: &[PathBuf]) -> OpenOptions {
        let mut search_paths = extra_paths.to_vec();
        search_paths.extend(self.search_paths.iter().cloned());

        OpenOptions {
            search_paths,
            load_mode: self.load_mode,
            batch_capacity: self.batch_capacity,
        }
    }
}
