// Symbol resolver and entry-point adapter
//
// All reinterpretation of raw symbol addresses as typed function pointers
// happens in this file. The rest of the crate only sees `ModelSymbols` and
// `ManifestFn`.

use std::ffi::{c_char, c_int, c_void};
use std::mem;
use tracing::debug;

use super::platform::LibraryHandle;
use crate::errors::Result;

/// Name of the manifest function every generated library exports
pub const MODEL_INFO_SYMBOL: &str = "model_info";

pub type ManifestFn = unsafe extern "C" fn(names: *mut *const *const c_char, count: *mut c_int);
pub type BufferSizeFn = unsafe extern "C" fn(input_dim: *mut u64, output_dim: *mut u64);
pub type AllocateFn = unsafe extern "C" fn(num_elements: u64) -> *mut c_void;
pub type DeallocateFn = unsafe extern "C" fn(buffer: *mut c_void);
pub type SendFn = unsafe extern "C" fn(device: *mut c_void, host: *const f64, len: u64) -> c_int;
pub type FetchFn = unsafe extern "C" fn(host: *mut f64, device: *const c_void, len: u64) -> c_int;
pub type ForwardFn =
    unsafe extern "C" fn(input: *const c_void, output: *mut c_void, rows: u64) -> c_int;
pub type JacobianFn = unsafe extern "C" fn(input: *const c_void, output: *mut c_void) -> c_int;
pub type ReentrantFn = unsafe extern "C" fn() -> c_int;

/// Per-model entry point suffixes, appended as `<model>_<suffix>`
pub mod entry {
    pub const BUFFER_SIZE: &str = "buffer_size";
    pub const ALLOCATE: &str = "allocate";
    pub const DEALLOCATE: &str = "deallocate";
    pub const SEND: &str = "send";
    pub const FETCH: &str = "fetch";
    pub const FORWARD: &str = "forward";
    pub const JACOBIAN: &str = "jacobian";
    pub const REENTRANT: &str = "reentrant";

    /// Entry points a model must export
    pub const REQUIRED: [&str; 7] = [
        BUFFER_SIZE,
        ALLOCATE,
        DEALLOCATE,
        SEND,
        FETCH,
        FORWARD,
        JACOBIAN,
    ];
}

/// Exported symbol name of a model's entry point
pub fn symbol_name(model: &str, entry: &str) -> String {
    format!("{}_{}", model, entry)
}

/// Resolve `symbol` and reinterpret its address as `F`
///
/// # Safety
/// `F` must be an `extern "C"` function pointer type matching the exported
/// signature.
unsafe fn resolve_fn<F: Copy, H: LibraryHandle>(handle: &H, symbol: &str) -> Result<F> {
    let address = handle.resolve(symbol)?;
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*const c_void>());
    Ok(mem::transmute_copy::<*const c_void, F>(&address))
}

/// Resolve the library's manifest function
pub(crate) fn resolve_manifest<H: LibraryHandle>(handle: &H) -> Result<ManifestFn> {
    unsafe { resolve_fn(handle, MODEL_INFO_SYMBOL) }
}

/// Typed entry points of one model
///
/// Holds plain function pointers only; it never owns or closes the library
/// they came from, so it must stay inside the crate where the registry
/// controls how long the library outlives it.
#[derive(Clone, Copy)]
pub(crate) struct ModelSymbols {
    buffer_size: BufferSizeFn,
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    send: SendFn,
    fetch: FetchFn,
    forward: ForwardFn,
    jacobian: JacobianFn,
    reentrant: Option<ReentrantFn>,
}

impl ModelSymbols {
    /// Resolve every entry point for `model`
    ///
    /// Fails with `SymbolNotFound` on the first missing required symbol. The
    /// reentrancy query is optional.
    pub(crate) fn resolve<H: LibraryHandle>(handle: &H, model: &str) -> Result<Self> {
        let name = |entry: &str| symbol_name(model, entry);

        let symbols = unsafe {
            Self {
                buffer_size: resolve_fn(handle, &name(entry::BUFFER_SIZE))?,
                allocate: resolve_fn(handle, &name(entry::ALLOCATE))?,
                deallocate: resolve_fn(handle, &name(entry::DEALLOCATE))?,
                send: resolve_fn(handle, &name(entry::SEND))?,
                fetch: resolve_fn(handle, &name(entry::FETCH))?,
                forward: resolve_fn(handle, &name(entry::FORWARD))?,
                jacobian: resolve_fn(handle, &name(entry::JACOBIAN))?,
                reentrant: resolve_fn(handle, &name(entry::REENTRANT)).ok(),
            }
        };

        debug!(
            model,
            reentrant_query = symbols.reentrant.is_some(),
            "Resolved model entry points"
        );
        Ok(symbols)
    }

    /// Input and output dimensions declared by the model
    pub(crate) fn buffer_size(&self) -> (u64, u64) {
        let mut input_dim = 0u64;
        let mut output_dim = 0u64;
        unsafe { (self.buffer_size)(&mut input_dim, &mut output_dim) };
        (input_dim, output_dim)
    }

    /// Whether the model reports its entry points as reentrant
    pub(crate) fn reentrant(&self) -> bool {
        match self.reentrant {
            Some(query) => unsafe { query() != 0 },
            None => false,
        }
    }

    /// Allocate a device buffer; null means the device is out of memory
    pub(crate) fn allocate(&self, num_elements: u64) -> *mut c_void {
        unsafe { (self.allocate)(num_elements) }
    }

    /// # Safety
    /// `buffer` must come from `allocate` on the same model and not be freed yet.
    pub(crate) unsafe fn deallocate(&self, buffer: *mut c_void) {
        (self.deallocate)(buffer)
    }

    /// # Safety
    /// `device` must be a live buffer holding at least `host.len()` elements.
    pub(crate) unsafe fn send(&self, device: *mut c_void, host: &[f64]) -> c_int {
        (self.send)(device, host.as_ptr(), host.len() as u64)
    }

    /// # Safety
    /// `device` must be a live buffer holding at least `host.len()` elements.
    pub(crate) unsafe fn fetch(&self, host: &mut [f64], device: *const c_void) -> c_int {
        (self.fetch)(host.as_mut_ptr(), device, host.len() as u64)
    }

    /// # Safety
    /// Both buffers must be live and sized for `rows` rows.
    pub(crate) unsafe fn forward(&self, input: *const c_void, output: *mut c_void, rows: u64) -> c_int {
        (self.forward)(input, output, rows)
    }

    /// # Safety
    /// Both buffers must be live; `output` must hold `output_dim * input_dim` elements.
    pub(crate) unsafe fn jacobian(&self, input: *const c_void, output: *mut c_void) -> c_int {
        (self.jacobian)(input, output)
    }
}

impl std::fmt::Debug for ModelSymbols {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSymbols")
            .field("reentrant_query", &self.reentrant.is_some())
            .finish_non_exhaustive()
    }
}
