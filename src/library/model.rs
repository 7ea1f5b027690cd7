// Model handle
//
// One handle per model declared by a library. The handle resolves the
// model's entry points, allocates its device buffers through the model's own
// allocator, and stages host data in and out of those buffers for every
// evaluation. It holds no reference that keeps the library loaded: the
// owning `ModelLibrary` drops every handle before it unloads the library.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::platform::LibraryHandle;
use super::symbols::{entry, symbol_name, ModelSymbols};
use crate::errors::{LibraryError, Result};

/// Capability set shared by every evaluable model
pub trait Evaluable {
    /// Model name as declared in the library manifest
    fn name(&self) -> &str;

    /// Number of inputs per row
    fn input_dim(&self) -> usize;

    /// Number of outputs per row
    fn output_dim(&self) -> usize;

    /// Evaluate the model at one input point
    fn forward(&self, input: &[f64]) -> Result<Vec<f64>>;

    /// Jacobian at one input point, as `output_dim` rows of `input_dim` columns
    fn jacobian(&self, input: &[f64]) -> Result<Vec<Vec<f64>>>;
}

/// Device-resident buffer freed through the model's deallocate entry point
struct DeviceBuffer {
    ptr: NonNull<c_void>,
    len: usize,
    symbols: ModelSymbols,
}

// The buffer is only touched while the owning handle's lock is held.
unsafe impl Send for DeviceBuffer {}

impl DeviceBuffer {
    fn allocate(symbols: &ModelSymbols, basename: &str, model: &str, len: usize) -> Result<Self> {
        let elements = len.max(1);
        let ptr = NonNull::new(symbols.allocate(elements as u64)).ok_or_else(|| {
            LibraryError::ResourceExhausted {
                basename: basename.to_string(),
                model: model.to_string(),
                elements,
            }
        })?;
        debug!(model, elements, "Allocated device buffer");
        Ok(Self {
            ptr,
            len: elements,
            symbols: *symbols,
        })
    }

    fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe { self.symbols.deallocate(self.ptr.as_ptr()) };
        debug!(elements = self.len, "Freed device buffer");
    }
}

/// Input and output staging buffers reused by every call
struct DeviceBuffers {
    input: DeviceBuffer,
    output: DeviceBuffer,
}

/// Host-side handle to one model inside a loaded library
///
/// Handles are only built by `ModelLibrary`, which keeps the library loaded
/// for as long as any handle it lends out is reachable:
///
/// ```compile_fail
/// use modelkit::library::{ModelHandle, NativeLoader, PlatformLoader};
///
/// let library = NativeLoader::default()
///     .open("robot_dynamics", std::path::Path::new("robot_dynamics.so"))
///     .unwrap();
/// let model = ModelHandle::new(&library, "robot_dynamics", "arm", 1);
/// ```
pub struct ModelHandle {
    name: String,
    input_dim: usize,
    output_dim: usize,
    /// `output_dim * input_dim`, checked at construction
    jacobian_len: usize,
    batch_capacity: usize,
    reentrant: bool,
    symbols: ModelSymbols,
    buffers: Mutex<DeviceBuffers>,
}

impl ModelHandle {
    /// Resolve the entry points of `name` and allocate its device buffers
    ///
    /// A missing required entry point or unrepresentable dimensions fail with
    /// `IncompatibleModel`, a failed allocation with `ResourceExhausted`.
    /// Buffers already allocated when a later allocation fails are released
    /// before returning.
    pub(crate) fn new<H: LibraryHandle>(
        library: &H,
        basename: &str,
        name: &str,
        batch_capacity: usize,
    ) -> Result<Self> {
        let incompatible = |e: LibraryError| LibraryError::IncompatibleModel {
            basename: basename.to_string(),
            model: name.to_string(),
            source: Box::new(e),
        };

        let symbols = ModelSymbols::resolve(library, name).map_err(incompatible)?;

        let (declared_input, declared_output) = symbols.buffer_size();
        let batch_capacity = batch_capacity.max(1);
        let layout = BufferLayout::new(declared_input, declared_output, batch_capacity)
            .ok_or_else(|| {
                incompatible(LibraryError::DimensionOverflow {
                    input_dim: declared_input,
                    output_dim: declared_output,
                    batch_capacity,
                })
            })?;

        let input = DeviceBuffer::allocate(&symbols, basename, name, layout.input_len)?;
        let output = DeviceBuffer::allocate(&symbols, basename, name, layout.output_len)?;

        debug!(
            model = name,
            input_dim = layout.input_dim,
            output_dim = layout.output_dim,
            batch_capacity,
            "Constructed model handle"
        );

        Ok(Self {
            name: name.to_string(),
            input_dim: layout.input_dim,
            output_dim: layout.output_dim,
            jacobian_len: layout.jacobian_len,
            batch_capacity,
            reentrant: symbols.reentrant(),
            symbols,
            buffers: Mutex::new(DeviceBuffers { input, output }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Maximum number of rows accepted by `forward_batch`
    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Whether the library declares this model's entry points reentrant
    ///
    /// Calls on one handle are serialized either way.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Evaluate the model at one input point
    pub fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_row(0, input)?;
        self.run_forward(input, 1)
    }

    /// Evaluate up to `batch_capacity` rows in a single native call
    pub fn forward_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if rows.len() > self.batch_capacity {
            return Err(self.invalid_input(format!(
                "batch of {} rows exceeds capacity {}",
                rows.len(),
                self.batch_capacity
            )));
        }

        let mut flat = Vec::with_capacity(rows.len() * self.input_dim);
        for (i, row) in rows.iter().enumerate() {
            self.check_row(i, row)?;
            flat.extend_from_slice(row);
        }

        let output = self.run_forward(&flat, rows.len())?;
        Ok(split_rows(output, rows.len(), self.output_dim))
    }

    /// Jacobian at one input point, as `output_dim` rows of `input_dim` columns
    pub fn jacobian(&self, input: &[f64]) -> Result<Vec<Vec<f64>>> {
        self.check_row(0, input)?;

        let buffers = self.lock();
        let mut output = vec![0.0; self.jacobian_len];
        unsafe {
            self.check_status(entry::SEND, self.symbols.send(buffers.input.as_ptr(), input))?;
            self.check_status(
                entry::JACOBIAN,
                self.symbols
                    .jacobian(buffers.input.as_ptr(), buffers.output.as_ptr()),
            )?;
            self.check_status(
                entry::FETCH,
                self.symbols.fetch(&mut output, buffers.output.as_ptr()),
            )?;
        }
        drop(buffers);

        Ok(split_rows(output, self.output_dim, self.input_dim))
    }

    fn run_forward(&self, flat: &[f64], rows: usize) -> Result<Vec<f64>> {
        // rows <= batch_capacity, whose product with output_dim was checked
        let buffers = self.lock();
        let mut output = vec![0.0; rows * self.output_dim];
        unsafe {
            self.check_status(entry::SEND, self.symbols.send(buffers.input.as_ptr(), flat))?;
            self.check_status(
                entry::FORWARD,
                self.symbols
                    .forward(buffers.input.as_ptr(), buffers.output.as_ptr(), rows as u64),
            )?;
            self.check_status(
                entry::FETCH,
                self.symbols.fetch(&mut output, buffers.output.as_ptr()),
            )?;
        }
        Ok(output)
    }

    fn lock(&self) -> MutexGuard<'_, DeviceBuffers> {
        // A panic while staging leaves the device buffers themselves intact
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_row(&self, index: usize, row: &[f64]) -> Result<()> {
        if row.len() != self.input_dim {
            return Err(self.invalid_input(format!(
                "row {} has {} values, expected {}",
                index,
                row.len(),
                self.input_dim
            )));
        }
        Ok(())
    }

    fn check_status(&self, entry_point: &str, status: c_int) -> Result<()> {
        if status != 0 {
            return Err(LibraryError::Evaluation {
                model: self.name.clone(),
                entry_point: symbol_name(&self.name, entry_point),
                status,
            });
        }
        Ok(())
    }

    fn invalid_input(&self, reason: String) -> LibraryError {
        LibraryError::InvalidInput {
            model: self.name.clone(),
            reason,
        }
    }
}

impl Evaluable for ModelHandle {
    fn name(&self) -> &str {
        ModelHandle::name(self)
    }

    fn input_dim(&self) -> usize {
        ModelHandle::input_dim(self)
    }

    fn output_dim(&self) -> usize {
        ModelHandle::output_dim(self)
    }

    fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        ModelHandle::forward(self, input)
    }

    fn jacobian(&self, input: &[f64]) -> Result<Vec<Vec<f64>>> {
        ModelHandle::jacobian(self, input)
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        debug!(model = %self.name, "Releasing model handle");
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("input_dim", &self.input_dim)
            .field("output_dim", &self.output_dim)
            .field("batch_capacity", &self.batch_capacity)
            .field("reentrant", &self.reentrant)
            .finish()
    }
}

/// Element counts derived from a model's declared dimensions
#[derive(Debug, PartialEq, Eq)]
struct BufferLayout {
    input_dim: usize,
    output_dim: usize,
    jacobian_len: usize,
    input_len: usize,
    output_len: usize,
}

impl BufferLayout {
    /// `None` if any count, or its size in bytes, does not fit in memory
    fn new(input_dim: u64, output_dim: u64, batch_capacity: usize) -> Option<Self> {
        let input_dim = usize::try_from(input_dim).ok()?;
        let output_dim = usize::try_from(output_dim).ok()?;

        let jacobian_len = element_count(output_dim, input_dim)?;
        let input_len = element_count(batch_capacity, input_dim)?;
        let output_len = element_count(batch_capacity, output_dim)?.max(jacobian_len);

        Some(Self {
            input_dim,
            output_dim,
            jacobian_len,
            input_len,
            output_len,
        })
    }
}

/// `a * b` elements of f64, if that many bytes can be allocated on the host
fn element_count(a: usize, b: usize) -> Option<usize> {
    let count = a.checked_mul(b)?;
    let bytes = count.checked_mul(std::mem::size_of::<f64>())?;
    (bytes <= isize::MAX as usize).then_some(count)
}

/// Split a flat row-major buffer into `rows` rows of `cols` values
fn split_rows(flat: Vec<f64>, rows: usize, cols: usize) -> Vec<Vec<f64>> {
    if cols == 0 {
        return vec![Vec::new(); rows];
    }
    flat.chunks(cols).map(<[f64]>::to_vec).collect()
}
