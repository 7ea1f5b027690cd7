// Test model library open/teardown ordering against a recording loader
//
// This test suite verifies that:
// 1. Every declared model is constructed and queryable after open
// 2. Failed opens release already-built models (reverse order) before unloading
// 3. Dropping or closing the registry frees device buffers before unloading
// 4. Evaluation failures stay local to the model that raised them

use modelkit::library::{
    platform_file_name, LibraryHandle, ModelLibrary, OpenOptions, PlatformLoader,
};
use modelkit::{Evaluable, LibraryError};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ffi::{c_char, c_int, c_void, CString};
use std::path::Path;
use tempfile::TempDir;

const LIBRARY: &str = "robot_dynamics";
const INPUT_DIM: usize = 3;
const OUTPUT_DIM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Alloc(usize),
    Free(usize),
    Close,
}

thread_local! {
    static EVENTS: RefCell<Vec<Event>> = RefCell::new(Vec::new());
    static LIVE_BUFFERS: Cell<usize> = Cell::new(0);
    static NEXT_BUFFER_ID: Cell<usize> = Cell::new(0);
    static FAIL_ALLOC_AT: Cell<Option<usize>> = Cell::new(None);
    static DECLARED_DIMS: Cell<(u64, u64)> = Cell::new((INPUT_DIM as u64, OUTPUT_DIM as u64));
    static MANIFEST: RefCell<(Vec<CString>, Vec<*const c_char>)> = RefCell::new((Vec::new(), Vec::new()));
}

fn record(event: Event) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

fn events() -> Vec<Event> {
    EVENTS.with(|events| events.borrow().clone())
}

fn live_buffers() -> usize {
    LIVE_BUFFERS.with(Cell::get)
}

/// Device buffer stand-in handed out by `mock_allocate`
struct MockBuffer {
    id: usize,
    data: Vec<f64>,
}

unsafe extern "C" fn mock_model_info(names: *mut *const *const c_char, count: *mut c_int) {
    MANIFEST.with(|manifest| {
        let manifest = manifest.borrow();
        *names = manifest.1.as_ptr();
        *count = manifest.1.len() as c_int;
    });
}

unsafe extern "C" fn mock_buffer_size(input_dim: *mut u64, output_dim: *mut u64) {
    let (declared_input, declared_output) = DECLARED_DIMS.with(Cell::get);
    *input_dim = declared_input;
    *output_dim = declared_output;
}

unsafe extern "C" fn mock_allocate(num_elements: u64) -> *mut c_void {
    let id = NEXT_BUFFER_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    });
    if FAIL_ALLOC_AT.with(Cell::get) == Some(id) {
        return std::ptr::null_mut();
    }
    LIVE_BUFFERS.with(|live| live.set(live.get() + 1));
    record(Event::Alloc(id));
    Box::into_raw(Box::new(MockBuffer {
        id,
        data: vec![0.0; num_elements as usize],
    })) as *mut c_void
}

unsafe extern "C" fn mock_deallocate(buffer: *mut c_void) {
    let buffer = Box::from_raw(buffer as *mut MockBuffer);
    LIVE_BUFFERS.with(|live| live.set(live.get() - 1));
    record(Event::Free(buffer.id));
}

unsafe extern "C" fn mock_send(device: *mut c_void, host: *const f64, len: u64) -> c_int {
    let buffer = &mut *(device as *mut MockBuffer);
    let host = std::slice::from_raw_parts(host, len as usize);
    if host.len() > buffer.data.len() {
        return 2;
    }
    buffer.data[..host.len()].copy_from_slice(host);
    0
}

unsafe extern "C" fn mock_fetch(host: *mut f64, device: *const c_void, len: u64) -> c_int {
    let buffer = &*(device as *const MockBuffer);
    let host = std::slice::from_raw_parts_mut(host, len as usize);
    if host.len() > buffer.data.len() {
        return 2;
    }
    host.copy_from_slice(&buffer.data[..host.len()]);
    0
}

/// output[i] = (i + 1) * sum(inputs), per row
unsafe extern "C" fn mock_forward(input: *const c_void, output: *mut c_void, rows: u64) -> c_int {
    let input = &*(input as *const MockBuffer);
    let output = &mut *(output as *mut MockBuffer);
    for r in 0..rows as usize {
        let row = &input.data[r * INPUT_DIM..(r + 1) * INPUT_DIM];
        if row.iter().any(|v| v.is_nan()) {
            return 1;
        }
        let sum: f64 = row.iter().sum();
        for i in 0..OUTPUT_DIM {
            output.data[r * OUTPUT_DIM + i] = (i + 1) as f64 * sum;
        }
    }
    0
}

unsafe extern "C" fn mock_jacobian(input: *const c_void, output: *mut c_void) -> c_int {
    let input = &*(input as *const MockBuffer);
    let output = &mut *(output as *mut MockBuffer);
    if input.data[..INPUT_DIM].iter().any(|v| v.is_nan()) {
        return 1;
    }
    for i in 0..OUTPUT_DIM {
        for j in 0..INPUT_DIM {
            output.data[i * INPUT_DIM + j] = (i + 1) as f64;
        }
    }
    0
}

unsafe extern "C" fn mock_reentrant() -> c_int {
    1
}

/// Loader double that serves the mock entry points above
#[derive(Default)]
struct MockLoader {
    missing: HashSet<String>,
    reentrant: bool,
    reject: Option<String>,
}

impl MockLoader {
    fn without(symbols: &[&str]) -> Self {
        Self {
            missing: symbols.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

struct MockLibrary {
    missing: HashSet<String>,
    reentrant: bool,
}

impl PlatformLoader for MockLoader {
    type Handle = MockLibrary;

    fn open(&self, basename: &str, path: &Path) -> modelkit::Result<MockLibrary> {
        if let Some(message) = &self.reject {
            return Err(LibraryError::LoadFailed {
                basename: basename.to_string(),
                path: path.to_path_buf(),
                message: message.clone(),
            });
        }
        Ok(MockLibrary {
            missing: self.missing.clone(),
            reentrant: self.reentrant,
        })
    }
}

impl LibraryHandle for MockLibrary {
    fn resolve(&self, symbol: &str) -> modelkit::Result<*const c_void> {
        let not_found = || LibraryError::SymbolNotFound {
            symbol: symbol.to_string(),
            message: "undefined symbol".to_string(),
        };
        if self.missing.contains(symbol) {
            return Err(not_found());
        }

        let address = if symbol == "model_info" {
            mock_model_info as *const c_void
        } else if symbol.ends_with("_buffer_size") {
            mock_buffer_size as *const c_void
        } else if symbol.ends_with("_deallocate") {
            mock_deallocate as *const c_void
        } else if symbol.ends_with("_allocate") {
            mock_allocate as *const c_void
        } else if symbol.ends_with("_send") {
            mock_send as *const c_void
        } else if symbol.ends_with("_fetch") {
            mock_fetch as *const c_void
        } else if symbol.ends_with("_forward") {
            mock_forward as *const c_void
        } else if symbol.ends_with("_jacobian") {
            mock_jacobian as *const c_void
        } else if symbol.ends_with("_reentrant") && self.reentrant {
            mock_reentrant as *const c_void
        } else {
            return Err(not_found());
        };
        Ok(address)
    }

    fn close(self) -> modelkit::Result<()> {
        record(Event::Close);
        Ok(())
    }
}

/// Reset mock state, declare `models`, and create a library file to find
fn setup(models: &[&str]) -> TempDir {
    EVENTS.with(|events| events.borrow_mut().clear());
    LIVE_BUFFERS.with(|live| live.set(0));
    NEXT_BUFFER_ID.with(|next| next.set(0));
    FAIL_ALLOC_AT.with(|fail| fail.set(None));
    DECLARED_DIMS.with(|dims| dims.set((INPUT_DIM as u64, OUTPUT_DIM as u64)));
    MANIFEST.with(|manifest| {
        let mut manifest = manifest.borrow_mut();
        manifest.0 = models.iter().map(|m| CString::new(*m).unwrap()).collect();
        manifest.1 = manifest.0.iter().map(|s| s.as_ptr()).collect();
    });

    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join(platform_file_name(LIBRARY)), b"").unwrap();
    temp_dir
}

fn options(temp_dir: &TempDir) -> OpenOptions {
    OpenOptions::new().search_path(temp_dir.path())
}

#[test]
fn test_robot_dynamics_scenario() {
    let temp_dir = setup(&["forward_dynamics", "inverse_dynamics"]);
    let loader = MockLoader {
        reentrant: true,
        ..MockLoader::default()
    };

    let library = ModelLibrary::open_with(&loader, LIBRARY, &options(&temp_dir)).unwrap();
    assert_eq!(library.basename(), LIBRARY);
    assert_eq!(
        library.model_names(),
        vec!["forward_dynamics".to_string(), "inverse_dynamics".to_string()]
    );
    assert!(library.has_model("inverse_dynamics"));

    let model = library.get_model("forward_dynamics").unwrap();
    assert!(model.is_reentrant());
    let output = model.forward(&[0.0, 1.0, 2.0]).unwrap();
    assert_eq!(output.len(), model.output_dim());
    assert_eq!(output, vec![3.0, 6.0]);

    let jacobian = model.jacobian(&[0.0, 1.0, 2.0]).unwrap();
    assert_eq!(jacobian, vec![vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0]]);
}

#[test]
fn test_empty_manifest_opens_without_allocating() {
    let temp_dir = setup(&[]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    assert!(library.is_empty());
    assert!(library.model_names().is_empty());
    drop(library);

    assert_eq!(events(), vec![Event::Close]);
}

#[test]
fn test_missing_manifest_is_incompatible_library() {
    let temp_dir = setup(&["forward_dynamics"]);
    let loader = MockLoader::without(&["model_info"]);

    let err = ModelLibrary::open_with(&loader, LIBRARY, &options(&temp_dir)).unwrap_err();
    match err {
        LibraryError::IncompatibleLibrary { basename, reason } => {
            assert_eq!(basename, LIBRARY);
            assert!(reason.contains("model_info"));
        }
        other => panic!("expected IncompatibleLibrary, got {:?}", other),
    }

    // Unloaded, and nothing was ever allocated
    assert_eq!(events(), vec![Event::Close]);
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_missing_model_symbol_tears_down_built_models_in_reverse() {
    let temp_dir = setup(&["a", "b", "c"]);
    let loader = MockLoader::without(&["c_jacobian"]);

    let err = ModelLibrary::open_with(&loader, LIBRARY, &options(&temp_dir)).unwrap_err();
    match &err {
        LibraryError::IncompatibleModel { model, source, .. } => {
            assert_eq!(model, "c");
            assert!(matches!(**source, LibraryError::SymbolNotFound { ref symbol, .. } if symbol == "c_jacobian"));
        }
        other => panic!("expected IncompatibleModel, got {:?}", other),
    }

    assert_eq!(
        events(),
        vec![
            Event::Alloc(0),
            Event::Alloc(1),
            Event::Alloc(2),
            Event::Alloc(3),
            // "b" first, then "a", then unload
            Event::Free(2),
            Event::Free(3),
            Event::Free(0),
            Event::Free(1),
            Event::Close,
        ]
    );
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_allocation_failure_releases_partial_buffers() {
    let temp_dir = setup(&["a", "b"]);
    // "b" gets its input buffer (id 2) but not its output buffer (id 3)
    FAIL_ALLOC_AT.with(|fail| fail.set(Some(3)));

    let err = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap_err();
    match &err {
        LibraryError::ResourceExhausted {
            basename, model, ..
        } => {
            assert_eq!(basename, LIBRARY);
            assert_eq!(model, "b");
        }
        other => panic!("expected ResourceExhausted, got {:?}", other),
    }
    assert!(err.to_string().contains(LIBRARY));

    assert_eq!(
        events(),
        vec![
            Event::Alloc(0),
            Event::Alloc(1),
            Event::Alloc(2),
            Event::Free(2),
            Event::Free(0),
            Event::Free(1),
            Event::Close,
        ]
    );
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_first_allocation_failure_names_library() {
    let temp_dir = setup(&["a", "b"]);
    FAIL_ALLOC_AT.with(|fail| fail.set(Some(0)));

    let err = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap_err();
    assert!(matches!(err, LibraryError::ResourceExhausted { ref model, .. } if model == "a"));
    assert!(err.to_string().contains(LIBRARY));

    assert_eq!(events(), vec![Event::Close]);
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_overflowing_dimensions_are_incompatible() {
    let temp_dir = setup(&["huge"]);
    DECLARED_DIMS.with(|dims| dims.set((u64::MAX, 2)));

    let err = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap_err();
    match &err {
        LibraryError::IncompatibleModel {
            basename,
            model,
            source,
        } => {
            assert_eq!(basename, LIBRARY);
            assert_eq!(model, "huge");
            assert!(matches!(**source, LibraryError::DimensionOverflow { input_dim, .. } if input_dim == u64::MAX));
        }
        other => panic!("expected IncompatibleModel, got {:?}", other),
    }

    // Rejected before any device memory was requested
    assert_eq!(events(), vec![Event::Close]);
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_drop_frees_all_buffers_before_unloading() {
    let temp_dir = setup(&["forward_dynamics", "inverse_dynamics", "contact"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    assert_eq!(live_buffers(), 6);
    drop(library);

    let events = events();
    let close_at = events.iter().position(|e| *e == Event::Close).unwrap();
    assert_eq!(close_at, events.len() - 1);
    let frees = events[..close_at]
        .iter()
        .filter(|e| matches!(e, Event::Free(_)))
        .count();
    assert_eq!(frees, 6);
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_explicit_close_unloads_exactly_once() {
    let temp_dir = setup(&["forward_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    library.close().unwrap();

    let closes = events().iter().filter(|e| **e == Event::Close).count();
    assert_eq!(closes, 1);
    assert_eq!(events().last(), Some(&Event::Close));
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_unknown_model_is_not_found() {
    let temp_dir = setup(&["forward_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    let err = library.get_model("nonexistent").unwrap_err();
    assert!(matches!(err, LibraryError::NotFound { ref model } if model == "nonexistent"));
    assert!(!library.has_model("nonexistent"));

    // Registry stays usable
    assert!(library.get_model("forward_dynamics").is_ok());
}

#[test]
fn test_evaluation_failure_is_local_to_model() {
    let temp_dir = setup(&["forward_dynamics", "inverse_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    let failing = library.get_model("forward_dynamics").unwrap();

    let err = failing.forward(&[f64::NAN, 0.0, 0.0]).unwrap_err();
    match err {
        LibraryError::Evaluation {
            model,
            entry_point,
            status,
        } => {
            assert_eq!(model, "forward_dynamics");
            assert_eq!(entry_point, "forward_dynamics_forward");
            assert_eq!(status, 1);
        }
        other => panic!("expected Evaluation, got {:?}", other),
    }

    let other = library.get_model("inverse_dynamics").unwrap();
    assert_eq!(other.forward(&[1.0, 1.0, 1.0]).unwrap(), vec![3.0, 6.0]);
    assert_eq!(failing.forward(&[1.0, 2.0, 3.0]).unwrap(), vec![6.0, 12.0]);
}

#[test]
fn test_wrong_input_length_is_rejected() {
    let temp_dir = setup(&["forward_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    let model = library.get_model("forward_dynamics").unwrap();

    assert!(matches!(
        model.forward(&[1.0, 2.0]),
        Err(LibraryError::InvalidInput { .. })
    ));
    assert!(matches!(
        model.jacobian(&[1.0, 2.0, 3.0, 4.0]),
        Err(LibraryError::InvalidInput { .. })
    ));
}

#[test]
fn test_forward_batch_respects_capacity() {
    let temp_dir = setup(&["forward_dynamics"]);

    let library = ModelLibrary::open_with(
        &MockLoader::default(),
        LIBRARY,
        &options(&temp_dir).batch_capacity(3),
    )
    .unwrap();
    let model = library.get_model("forward_dynamics").unwrap();
    assert_eq!(model.batch_capacity(), 3);

    let rows = vec![
        vec![1.0, 0.0, 0.0],
        vec![1.0, 1.0, 0.0],
        vec![1.0, 1.0, 1.0],
    ];
    let outputs = model.forward_batch(&rows).unwrap();
    assert_eq!(
        outputs,
        vec![vec![1.0, 2.0], vec![2.0, 4.0], vec![3.0, 6.0]]
    );

    let too_many = vec![vec![0.0; INPUT_DIM]; 4];
    assert!(matches!(
        model.forward_batch(&too_many),
        Err(LibraryError::InvalidInput { .. })
    ));
    assert!(model.forward_batch(&[]).unwrap().is_empty());
}

#[test]
fn test_load_failure_keeps_native_message() {
    let temp_dir = setup(&["forward_dynamics"]);
    let loader = MockLoader {
        reject: Some("wrong ELF class: ELFCLASS32".to_string()),
        ..MockLoader::default()
    };

    let err = ModelLibrary::open_with(&loader, LIBRARY, &options(&temp_dir)).unwrap_err();
    match err {
        LibraryError::LoadFailed {
            basename, message, ..
        } => {
            assert_eq!(basename, LIBRARY);
            assert!(message.contains("ELFCLASS32"));
        }
        other => panic!("expected LoadFailed, got {:?}", other),
    }
    assert!(events().is_empty());
}

#[test]
fn test_missing_file_is_library_not_found() {
    let temp_dir = setup(&["forward_dynamics"]);

    let err = ModelLibrary::open_with(
        &MockLoader::default(),
        "not_built_yet",
        &options(&temp_dir),
    )
    .unwrap_err();
    assert!(matches!(err, LibraryError::LibraryNotFound { ref basename, .. } if basename == "not_built_yet"));
    assert!(events().is_empty());
}

#[test]
fn test_concurrent_queries_and_evaluation_on_distinct_models() {
    let temp_dir = setup(&["forward_dynamics", "inverse_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();

    std::thread::scope(|scope| {
        for name in ["forward_dynamics", "inverse_dynamics"] {
            let library = &library;
            scope.spawn(move || {
                for i in 0..100 {
                    assert!(library.has_model(name));
                    assert_eq!(library.model_names().len(), 2);
                    let model = library.get_model(name).unwrap();
                    let x = i as f64;
                    assert_eq!(model.forward(&[x, x, x]).unwrap(), vec![3.0 * x, 6.0 * x]);
                }
            });
        }
    });

    drop(library);
    assert_eq!(live_buffers(), 0);
}

#[test]
fn test_models_usable_through_capability_trait() {
    let temp_dir = setup(&["forward_dynamics"]);

    let library = ModelLibrary::open_with(&MockLoader::default(), LIBRARY, &options(&temp_dir))
        .unwrap();
    let model: &dyn Evaluable = library.get_model("forward_dynamics").unwrap();

    assert_eq!(model.name(), "forward_dynamics");
    assert_eq!(model.input_dim(), INPUT_DIM);
    assert_eq!(model.output_dim(), OUTPUT_DIM);
    assert_eq!(model.forward(&[2.0, 0.0, 0.0]).unwrap(), vec![2.0, 4.0]);
    assert!(!library.get_model("forward_dynamics").unwrap().is_reentrant());
}
