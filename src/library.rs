//! Lifecycle management for the dynamically loaded engine module
//!
//! The engine ships as a closed shared library. [`LibraryManager`] keeps it
//! loaded exactly while at least one caller holds a registration, hands out
//! cached per-(caller, format) interface handles, and probes what the build
//! of the engine behind a path can actually do.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::format::{ArchiveFormat, InArchiveFormat, OutArchiveFormat};
use crate::source::{UpdateContext, UpdateItemSource};
use crate::update::{ArchiveUpdateCallback, run_update};

use sevenzip2_sys as sys;

/// A loaded engine module: the one entry point this crate drives plus
/// whatever keeps the underlying library mapped
pub trait EngineModule: Send + Sync {
    /// Instantiate a format handler by class id, asking for `interface_id`
    fn create_object(&self, class_id: &sys::GUID, interface_id: &sys::GUID)
    -> Result<NonNull<c_void>>;
}

/// Strategy for turning a file-system path into a loaded [`EngineModule`]
pub trait EngineLoader: Send + Sync {
    /// Load the module at `path`
    fn load(&self, path: &Path) -> Result<Box<dyn EngineModule>>;
}

/// Default loader backed by the platform dynamic linker
pub struct DynamicLoader;

struct LoadedModule {
    create_object: sys::CreateObjectFn,
    _library: libloading::Library,
}

impl EngineLoader for DynamicLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn EngineModule>> {
        // SAFETY: loading an engine module runs its initializers; the path is
        // caller-vetted and the two entry points are probed before use
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| Error::LibraryLoad(format!("{}: {}", path.display(), e)))?;
        let create_object = unsafe {
            // both entry points must resolve; their presence is what marks a
            // real engine module rather than an arbitrary shared library
            let _probe: libloading::Symbol<'_, sys::GetHandlerPropertyFn> = library
                .get(sys::FN_GET_HANDLER_PROPERTY)
                .map_err(|e| Error::LibraryLoad(format!("{}: {}", path.display(), e)))?;
            let symbol: libloading::Symbol<'_, sys::CreateObjectFn> = library
                .get(sys::FN_CREATE_OBJECT)
                .map_err(|e| Error::LibraryLoad(format!("{}: {}", path.display(), e)))?;
            *symbol
        };
        log::debug!("loaded engine module from {}", path.display());
        Ok(Box::new(LoadedModule {
            create_object,
            _library: library,
        }))
    }
}

impl EngineModule for LoadedModule {
    fn create_object(
        &self,
        class_id: &sys::GUID,
        interface_id: &sys::GUID,
    ) -> Result<NonNull<c_void>> {
        let mut object: *mut c_void = std::ptr::null_mut();
        // SAFETY: the entry point stays valid while _library keeps the module
        // mapped, and all three pointers are live locals
        let code = unsafe { (self.create_object)(class_id, interface_id, &mut object) };
        Error::from_hresult(code)?;
        NonNull::new(object).ok_or(Error::Native { code: sys::E_FAIL })
    }
}

struct InterfaceInner {
    ptr: NonNull<c_void>,
    // Keeps the module mapped for as long as any handle clone is alive, even
    // past the manager's own unload
    _module: Arc<dyn EngineModule>,
}

// The engine serializes access to its objects internally; the pointer is only
// handed back to the engine that produced it.
unsafe impl Send for InterfaceInner {}
unsafe impl Sync for InterfaceInner {}

impl Drop for InterfaceInner {
    fn drop(&mut self) {
        // SAFETY: every engine object starts with the uniform release slot,
        // and Drop runs exactly once for the last clone
        unsafe {
            let object = self.ptr.as_ptr() as *mut sys::EngineObject;
            ((*(*object).vtbl).release)(self.ptr.as_ptr());
        }
    }
}

/// Shared handle to an engine-created format handler. Cloning is cheap; the
/// native object is released when the last clone drops.
#[derive(Clone)]
pub struct NativeInterfaceHandle {
    inner: Arc<InterfaceInner>,
}

impl NativeInterfaceHandle {
    fn new(ptr: NonNull<c_void>, module: Arc<dyn EngineModule>) -> Self {
        NativeInterfaceHandle {
            inner: Arc::new(InterfaceInner {
                ptr,
                _module: module,
            }),
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut c_void {
        self.inner.ptr.as_ptr()
    }
}

/// Opaque identity of one registration owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

impl CallerId {
    /// Mint a process-unique caller id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CallerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a loaded engine build can do, as established by probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet(u32);

impl FeatureSet {
    /// Can produce 7z archives
    pub const COMPRESS_7Z: FeatureSet = FeatureSet(1 << 0);
    /// Can produce zip archives
    pub const COMPRESS_ZIP: FeatureSet = FeatureSet(1 << 1);
    /// Can produce gzip streams
    pub const COMPRESS_GZIP: FeatureSet = FeatureSet(1 << 2);
    /// Can produce bzip2 streams
    pub const COMPRESS_BZIP2: FeatureSet = FeatureSet(1 << 3);
    /// Can produce tar archives
    pub const COMPRESS_TAR: FeatureSet = FeatureSet(1 << 4);
    /// Can produce xz streams
    pub const COMPRESS_XZ: FeatureSet = FeatureSet(1 << 5);
    /// Can open 7z archives
    pub const EXTRACT_7Z: FeatureSet = FeatureSet(1 << 8);
    /// Can open zip archives
    pub const EXTRACT_ZIP: FeatureSet = FeatureSet(1 << 9);
    /// Can open gzip streams
    pub const EXTRACT_GZIP: FeatureSet = FeatureSet(1 << 10);
    /// Can open bzip2 streams
    pub const EXTRACT_BZIP2: FeatureSet = FeatureSet(1 << 11);
    /// Can open tar archives
    pub const EXTRACT_TAR: FeatureSet = FeatureSet(1 << 12);
    /// Can open rar archives
    pub const EXTRACT_RAR: FeatureSet = FeatureSet(1 << 13);
    /// Can open xz streams
    pub const EXTRACT_XZ: FeatureSet = FeatureSet(1 << 14);
    /// Can open raw lzma streams
    pub const EXTRACT_LZMA: FeatureSet = FeatureSet(1 << 15);
    /// Can open cab archives
    pub const EXTRACT_CAB: FeatureSet = FeatureSet(1 << 16);
    /// Can open iso images
    pub const EXTRACT_ISO: FeatureSet = FeatureSet(1 << 17);
    /// Can rename and delete items of existing archives in place
    pub const MODIFY: FeatureSet = FeatureSet(1 << 24);

    /// The empty set
    pub const fn empty() -> Self {
        FeatureSet(0)
    }

    /// Whether every bit of `other` is present
    pub const fn contains(self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Add the bits of `other`
    pub fn insert(&mut self, other: FeatureSet) {
        self.0 |= other.0;
    }

    /// Whether no capability was established
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

struct ManagerInner {
    path: PathBuf,
    module: Option<Arc<dyn EngineModule>>,
    registrations: HashMap<(CallerId, ArchiveFormat), Option<NativeInterfaceHandle>>,
    features: Option<FeatureSet>,
}

/// Reference-counted owner of the engine module
///
/// The module is loaded when the first `(caller, format)` registration
/// arrives and unloaded when the last one leaves; interface objects are
/// created lazily per registration and cached until the registration is
/// dropped. All state sits behind one mutex, so every operation is atomic
/// with respect to concurrent callers.
pub struct LibraryManager {
    loader: Box<dyn EngineLoader>,
    inner: Mutex<ManagerInner>,
}

const PROBE_PAYLOAD: &[u8] = b"capability probe payload";

impl LibraryManager {
    /// Manage the engine module at `path` using the platform dynamic linker
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_loader(path, Box::new(DynamicLoader))
    }

    /// Manage the engine module at `path` with a caller-supplied loader
    pub fn with_loader(path: impl Into<PathBuf>, loader: Box<dyn EngineLoader>) -> Self {
        LibraryManager {
            loader,
            inner: Mutex::new(ManagerInner {
                path: path.into(),
                module: None,
                registrations: HashMap::new(),
                features: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        // a poisoned manager still holds consistent refcount state
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Path the module is (or will be) loaded from
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Whether the engine module is currently loaded
    pub fn loaded(&self) -> bool {
        self.lock().module.is_some()
    }

    /// Declare that `caller` uses `format`. The first registration overall
    /// loads the module. Registering the same pair again is a no-op.
    pub fn register(&self, caller: CallerId, format: impl Into<ArchiveFormat>) -> Result<()> {
        let format = format.into();
        let mut inner = self.lock();
        if inner.registrations.contains_key(&(caller, format)) {
            return Ok(());
        }
        self.ensure_loaded(&mut inner)?;
        inner.registrations.insert((caller, format), None);
        Ok(())
    }

    /// Drop `caller`'s use of `format`, releasing its cached interface. The
    /// last registration overall unloads the module. Unknown pairs are
    /// ignored.
    pub fn unregister(&self, caller: CallerId, format: impl Into<ArchiveFormat>) {
        let format = format.into();
        let mut inner = self.lock();
        if inner.registrations.remove(&(caller, format)).is_none() {
            return;
        }
        if inner.registrations.is_empty() {
            inner.module = None;
            log::debug!("last registration dropped, engine module unloaded");
        }
    }

    /// Native handler for `caller`'s use of `format`, created on first use
    /// and cached for the registration's lifetime. Registers the pair if the
    /// caller has not done so yet.
    pub fn interface_for(
        &self,
        caller: CallerId,
        format: impl Into<ArchiveFormat>,
    ) -> Result<NativeInterfaceHandle> {
        let format = format.into();
        let mut inner = self.lock();
        if let Some(Some(handle)) = inner.registrations.get(&(caller, format)) {
            return Ok(handle.clone());
        }
        let module = self.ensure_loaded(&mut inner)?;
        let handle = create_interface(&module, format)?;
        inner
            .registrations
            .insert((caller, format), Some(handle.clone()));
        Ok(handle)
    }

    /// What the engine build behind the current path can do
    ///
    /// The first call probes the module by exercising it: each writable
    /// format is asked to produce a minimal archive, each readable format is
    /// asked to instantiate its handler. Results are cached until
    /// [`set_path`](Self::set_path) changes the module. A module loaded only
    /// for probing is unloaded again before returning.
    pub fn features(&self) -> Result<FeatureSet> {
        let mut inner = self.lock();
        if let Some(cached) = inner.features {
            return Ok(cached);
        }
        let loaded_for_probe = inner.module.is_none();
        let module = self.ensure_loaded(&mut inner)?;

        let mut features = FeatureSet::empty();
        let compressors = [
            (OutArchiveFormat::SevenZip, FeatureSet::COMPRESS_7Z),
            (OutArchiveFormat::Zip, FeatureSet::COMPRESS_ZIP),
            (OutArchiveFormat::GZip, FeatureSet::COMPRESS_GZIP),
            (OutArchiveFormat::BZip2, FeatureSet::COMPRESS_BZIP2),
            (OutArchiveFormat::Tar, FeatureSet::COMPRESS_TAR),
            (OutArchiveFormat::Xz, FeatureSet::COMPRESS_XZ),
        ];
        for (format, flag) in compressors {
            if compression_probe(&module, format) {
                features.insert(flag);
            }
        }
        let extractors = [
            (InArchiveFormat::SevenZip, FeatureSet::EXTRACT_7Z),
            (InArchiveFormat::Zip, FeatureSet::EXTRACT_ZIP),
            (InArchiveFormat::GZip, FeatureSet::EXTRACT_GZIP),
            (InArchiveFormat::BZip2, FeatureSet::EXTRACT_BZIP2),
            (InArchiveFormat::Tar, FeatureSet::EXTRACT_TAR),
            (InArchiveFormat::Rar, FeatureSet::EXTRACT_RAR),
            (InArchiveFormat::Xz, FeatureSet::EXTRACT_XZ),
            (InArchiveFormat::Lzma, FeatureSet::EXTRACT_LZMA),
            (InArchiveFormat::Cab, FeatureSet::EXTRACT_CAB),
            (InArchiveFormat::Iso, FeatureSet::EXTRACT_ISO),
        ];
        for (format, flag) in extractors {
            if create_interface(&module, format.into()).is_ok() {
                features.insert(flag);
            }
        }
        // in-place modification runs through the 7z writer
        if features.contains(FeatureSet::COMPRESS_7Z) {
            features.insert(FeatureSet::MODIFY);
        }

        if loaded_for_probe && inner.registrations.is_empty() {
            inner.module = None;
            log::debug!("probe-only load released, engine module unloaded");
        }
        inner.features = Some(features);
        Ok(features)
    }

    /// Point the manager at a different engine module
    ///
    /// Refused while a module from another path is loaded, and when `path`
    /// does not exist. Changing the path invalidates cached probe results.
    pub fn set_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let mut inner = self.lock();
        if path == inner.path {
            return Ok(());
        }
        if inner.module.is_some() {
            return Err(Error::InvalidState(format!(
                "engine module already loaded from {}; unregister all callers first",
                inner.path.display()
            )));
        }
        if !path.exists() {
            return Err(Error::InvalidState(format!(
                "engine module file does not exist: {}",
                path.display()
            )));
        }
        inner.path = path;
        inner.features = None;
        Ok(())
    }

    fn ensure_loaded(&self, inner: &mut ManagerInner) -> Result<Arc<dyn EngineModule>> {
        if let Some(module) = &inner.module {
            return Ok(Arc::clone(module));
        }
        let module: Arc<dyn EngineModule> = Arc::from(self.loader.load(&inner.path)?);
        inner.module = Some(Arc::clone(&module));
        Ok(module)
    }
}

fn create_interface(
    module: &Arc<dyn EngineModule>,
    format: ArchiveFormat,
) -> Result<NativeInterfaceHandle> {
    let class_id = format.class_id();
    let interface_id = format.interface_id();
    match module.create_object(&class_id, &interface_id) {
        Ok(ptr) => Ok(NativeInterfaceHandle::new(ptr, Arc::clone(module))),
        Err(error) => {
            log::debug!("engine refused handler for {}: {}", format.name(), error);
            Err(Error::UnsupportedFormat {
                format: format.name().to_string(),
            })
        }
    }
}

/// Establish write support for `format` by producing a minimal archive
fn compression_probe(module: &Arc<dyn EngineModule>, format: OutArchiveFormat) -> bool {
    let Ok(handle) = create_interface(module, format.into()) else {
        return false;
    };
    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream(Box::new(Cursor::new(PROBE_PAYLOAD.to_vec()))),
        UpdateContext::create(),
    )
    .default_item_name("probe.bin")
    .output_format(format);
    match run_update(&handle, Vec::new(), callback) {
        Ok(bytes) => !bytes.is_empty(),
        Err(error) => {
            log::debug!("write probe for {} failed: {}", format.name(), error);
            false
        }
    }
}
