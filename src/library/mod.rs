// Accelerator model library loading
// Platform loader, symbol adapter, manifest, model handles and the registry

pub mod manifest;
pub mod model;
pub mod platform;
pub mod registry;
pub mod search;
pub mod symbols;

pub use manifest::list_models;
pub use model::{Evaluable, ModelHandle};
pub use platform::{LibraryHandle, LoadMode, NativeLibrary, NativeLoader, PlatformLoader};
pub use registry::{ModelLibrary, OpenOptions};
pub use search::{candidate_paths, locate_library, platform_file_name, LIBRARY_PATH_ENV};
pub use symbols::{entry, symbol_name, MODEL_INFO_SYMBOL};
