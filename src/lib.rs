// Modelkit - loader for code-generated accelerator model libraries
// Library exports

pub mod config;
pub mod errors;
pub mod library; // Platform loader, model handles, registry

pub use errors::{LibraryError, Result};
pub use library::{Evaluable, ModelHandle, ModelLibrary, OpenOptions};
