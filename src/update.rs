//! Archive update callback: answers the engine's per-item callback sequence
//! for one archive-write operation
//!
//! The engine drives the callback synchronously, item by item, in ascending
//! index order. The safe state machine lives in [`ArchiveUpdateCallback`];
//! the raw function tables the engine actually invokes are built around it
//! with boxed state behind a `Mutex`, mirroring how the read/write callbacks
//! hand Rust streams to a C engine elsewhere in this crate family.

use std::any::Any;
use std::ffi::c_void;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, OperationResult, Result};
use crate::format::OutArchiveFormat;
use crate::library::NativeInterfaceHandle;
use crate::progress::{CountingReader, ProgressAggregator};
use crate::property::{
    ATTR_DIRECTORY, ATTR_NORMAL, PropertyId, PropertyValue, attributes_from_metadata, extension_of,
    filetime_from_system, filetime_now, malloc_c_string,
};
use crate::source::{ItemSnapshot, StreamMapEntry, UpdateContext, UpdateItemSource, UpdateMode};

use sevenzip2_sys as sys;

/// Subscription points for one archive-write operation
///
/// All methods default to no-ops; implement the ones you care about.
pub trait UpdateEvents: Send {
    /// The next item is about to be packed. Return `false` to cancel the
    /// operation; no further items will be processed.
    fn item_starting(&mut self, _name: &str, _percent: u8) -> bool {
        true
    }

    /// The percent-complete value increased
    fn progress(&mut self, _percent: u8, _delta: u8) {}

    /// The engine finished consuming the current item's stream
    fn item_finished(&mut self) {}
}

/// Answer to the engine's `get_update_item_info` question for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    /// Whether the item's byte content must be supplied anew
    pub needs_new_data: bool,
    /// Whether the item's properties must be supplied anew
    pub needs_new_properties: bool,
    /// Existing archive index the item maps to, or
    /// [`sevenzip2_sys::INDEX_NEW_ITEM`] for new items
    pub index_in_archive: u32,
}

/// Protocol state machine for one archive-write operation
///
/// Constructed from an [`UpdateItemSource`] and an [`UpdateContext`], then
/// driven by the engine through [`run_update`]. All per-item questions the
/// engine asks are answered by the public methods here; failures that concern
/// a single item are captured and surfaced after the operation completes
/// rather than raised across the native boundary.
pub struct ArchiveUpdateCallback {
    source: UpdateItemSource,
    context: UpdateContext,
    directory_structure: bool,
    default_item_name: String,
    password: Option<String>,
    defer_stream_release: bool,
    total_bytes: u64,
    data_items: usize,
    items_started: usize,
    snapshots: Vec<ItemSnapshot>,
    events: Option<Arc<Mutex<Box<dyn UpdateEvents>>>>,
    progress: Arc<ProgressAggregator>,
    captured: Vec<Error>,
    cancelled: bool,
    current_stream: Option<Box<dyn Any + Send>>,
    deferred_streams: Vec<Box<dyn Any + Send>>,
}

impl ArchiveUpdateCallback {
    /// Create a callback for one operation over `source` in the mode
    /// described by `context`
    pub fn new(mut source: UpdateItemSource, context: UpdateContext) -> Self {
        let (total_bytes, snapshots) = source.measure();
        let data_items = source.data_item_count();
        ArchiveUpdateCallback {
            source,
            context,
            directory_structure: true,
            default_item_name: "default".to_string(),
            password: None,
            defer_stream_release: false,
            total_bytes,
            data_items,
            items_started: 0,
            snapshots,
            events: None,
            progress: Arc::new(ProgressAggregator::new(total_bytes)),
            captured: Vec::new(),
            cancelled: false,
            current_stream: None,
            deferred_streams: Vec::new(),
        }
    }

    /// Set the archive password handed to the engine on request
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the item name used for single-stream sources
    pub fn default_item_name(mut self, name: impl Into<String>) -> Self {
        self.default_item_name = name.into();
        self
    }

    /// Whether archive paths keep their directory structure (common root
    /// stripped) or are stored as given. Defaults to true.
    pub fn preserve_directory_structure(mut self, preserve: bool) -> Self {
        self.directory_structure = preserve;
        self
    }

    /// Record the output format so stream-release semantics match the
    /// engine's expectations for it
    pub fn output_format(mut self, format: OutArchiveFormat) -> Self {
        self.defer_stream_release = format.holds_streams_until_end();
        self
    }

    /// Subscribe to item and progress notifications
    pub fn events(mut self, events: Box<dyn UpdateEvents>) -> Self {
        let shared = Arc::new(Mutex::new(events));
        let sink = Arc::clone(&shared);
        self.progress = Arc::new(ProgressAggregator::with_callback(
            self.total_bytes,
            Some(Box::new(move |percent: u8, delta: u8| {
                if let Ok(mut events) = sink.lock() {
                    events.progress(percent, delta);
                }
            })),
        ));
        self.events = Some(shared);
        self
    }

    /// Size of the contiguous index range `[0, N)` presented to the engine
    pub fn presented_item_count(&self) -> u32 {
        self.context.presented_item_count(self.source.item_count())
    }

    /// Declared total byte count for this operation
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether a subscriber cancelled the operation
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Drain the recoverable errors captured during the operation
    pub fn take_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.captured)
    }

    pub(crate) fn capture(&mut self, error: Error) {
        log::warn!("captured item error: {}", error);
        self.captured.push(error);
    }

    /// Answer whether item `index` needs new data and/or properties, and
    /// which existing archive index it maps to
    pub fn item_disposition(&self, index: u32) -> Disposition {
        match self.context.mode {
            UpdateMode::Create => Disposition {
                needs_new_data: true,
                needs_new_properties: true,
                index_in_archive: sys::INDEX_NEW_ITEM,
            },
            UpdateMode::Append => {
                if index < self.context.existing_count {
                    Disposition {
                        needs_new_data: false,
                        needs_new_properties: false,
                        index_in_archive: index,
                    }
                } else {
                    Disposition {
                        needs_new_data: true,
                        needs_new_properties: true,
                        index_in_archive: sys::INDEX_NEW_ITEM,
                    }
                }
            }
            UpdateMode::Modify => {
                // Survivors are renumbered past tombstoned predecessors so
                // the engine sees a contiguous, order-preserving index space.
                let renamed = matches!(self.context.rename_map.get(&index), Some(Some(_)));
                Disposition {
                    needs_new_data: false,
                    needs_new_properties: renamed,
                    index_in_archive: index - self.context.tombstones_below(index),
                }
            }
        }
    }

    /// Resolve one property of item `index`. Resolution failures are captured
    /// and a best-effort value is returned so the engine can continue.
    pub fn property(&mut self, index: u32, prop: PropertyId) -> PropertyValue {
        // IsAnti is mode-independent: this crate never produces anti-items
        if prop == PropertyId::IsAnti {
            return PropertyValue::Bool(false);
        }
        let Some(local) = index.checked_sub(self.context.index_offset()) else {
            self.capture(Error::InvalidArgument(format!(
                "property query for index {} below the operation's offset",
                index
            )));
            return PropertyValue::Empty;
        };
        match self.context.mode {
            UpdateMode::Modify => self.existing_property(local, prop),
            UpdateMode::Create | UpdateMode::Append => self.new_item_property(local, prop),
        }
    }

    fn existing_property(&mut self, local: u32, prop: PropertyId) -> PropertyValue {
        let item = match self.context.existing_items.get(local as usize) {
            Some(item) => item.clone(),
            None => {
                self.capture(Error::InvalidArgument(format!(
                    "no existing-item metadata for index {}",
                    local
                )));
                return PropertyValue::Empty;
            }
        };
        let name = match self.context.rename_map.get(&local) {
            Some(Some(new_name)) => new_name.clone(),
            _ => item.name.clone(),
        };
        match prop {
            PropertyId::Path => PropertyValue::Str(name),
            PropertyId::IsDirectory => PropertyValue::Bool(item.is_directory),
            PropertyId::Size => PropertyValue::U64(item.size),
            PropertyId::Attributes => PropertyValue::U32(item.attributes),
            PropertyId::CreationTime => PropertyValue::FileTime(item.creation_time),
            PropertyId::LastAccessTime => PropertyValue::FileTime(item.last_access_time),
            PropertyId::LastWriteTime => PropertyValue::FileTime(item.last_write_time),
            PropertyId::Extension => PropertyValue::Str(extension_of(&name)),
            // Existing items have no file-system source
            PropertyId::SourcePath => PropertyValue::Empty,
            PropertyId::IsAnti => PropertyValue::Bool(false),
        }
    }

    fn new_item_property(&mut self, local: u32, prop: PropertyId) -> PropertyValue {
        match prop {
            PropertyId::Path => PropertyValue::Str(self.item_name(local)),
            PropertyId::Extension => PropertyValue::Str(extension_of(&self.item_name(local))),
            PropertyId::IsDirectory => PropertyValue::Bool(self.is_directory(local)),
            PropertyId::Size => PropertyValue::U64(self.item_size(local)),
            PropertyId::Attributes => {
                let attributes = match self.item_metadata(local) {
                    Some(metadata) => attributes_from_metadata(&metadata),
                    None if self.is_directory(local) => ATTR_DIRECTORY,
                    None => ATTR_NORMAL,
                };
                PropertyValue::U32(attributes)
            }
            PropertyId::CreationTime => {
                PropertyValue::FileTime(self.item_time(local, |m| m.created()))
            }
            PropertyId::LastAccessTime => {
                PropertyValue::FileTime(self.item_time(local, |m| m.accessed()))
            }
            PropertyId::LastWriteTime => {
                PropertyValue::FileTime(self.item_time(local, |m| m.modified()))
            }
            PropertyId::SourcePath => match &self.source {
                UpdateItemSource::Files { entries, .. } => entries
                    .get(local as usize)
                    .map(|p| PropertyValue::Str(p.to_string_lossy().into_owned()))
                    .unwrap_or(PropertyValue::Empty),
                UpdateItemSource::StreamMap { entries } => entries
                    .get(local as usize)
                    .and_then(|e| e.source_path.as_ref())
                    .map(|p| PropertyValue::Str(p.to_string_lossy().into_owned()))
                    .unwrap_or(PropertyValue::Empty),
                _ => PropertyValue::Empty,
            },
            PropertyId::IsAnti => PropertyValue::Bool(false),
        }
    }

    /// Archive name of new item `local`
    fn item_name(&self, local: u32) -> String {
        match &self.source {
            UpdateItemSource::Files {
                entries,
                alt_names,
                common_root_len,
            } => {
                if let Some(Some(alt)) = alt_names.as_ref().and_then(|n| n.get(local as usize)) {
                    return alt.clone();
                }
                let Some(path) = entries.get(local as usize) else {
                    return self.default_item_name.clone();
                };
                let full = path.to_string_lossy();
                if self.directory_structure {
                    let stripped = full.get(*common_root_len..).unwrap_or(&full);
                    stripped.trim_start_matches(['/', '\\']).to_string()
                } else {
                    full.into_owned()
                }
            }
            UpdateItemSource::Stream { .. } => self.default_item_name.clone(),
            UpdateItemSource::StreamMap { entries } => entries
                .get(local as usize)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| self.default_item_name.clone()),
            UpdateItemSource::Existing => self.default_item_name.clone(),
        }
    }

    fn is_directory(&self, local: u32) -> bool {
        match &self.source {
            UpdateItemSource::Files { entries, .. } => entries
                .get(local as usize)
                .and_then(|p| p.metadata().ok())
                .map(|m| m.is_dir())
                .unwrap_or(false),
            UpdateItemSource::Stream { .. } => false,
            UpdateItemSource::StreamMap { .. } => self
                .snapshots
                .get(local as usize)
                .map(|snapshot| snapshot.is_directory)
                .unwrap_or(false),
            UpdateItemSource::Existing => false,
        }
    }

    fn item_size(&mut self, local: u32) -> u64 {
        if self.is_directory(local) {
            return 0;
        }
        match &self.source {
            UpdateItemSource::Files { entries, .. } => {
                let Some(path) = entries.get(local as usize) else {
                    return 0;
                };
                match path.metadata() {
                    Ok(metadata) => metadata.len(),
                    Err(source) => {
                        let item = path.to_string_lossy().into_owned();
                        self.capture(Error::ItemResolution { item, source });
                        0
                    }
                }
            }
            UpdateItemSource::Stream { .. } => {
                self.snapshots.first().map(|snapshot| snapshot.size).unwrap_or(0)
            }
            UpdateItemSource::StreamMap { .. } => self
                .snapshots
                .get(local as usize)
                .map(|snapshot| snapshot.size)
                .unwrap_or(0),
            UpdateItemSource::Existing => 0,
        }
    }

    /// File-system metadata backing new item `local`, if any
    fn item_metadata(&self, local: u32) -> Option<std::fs::Metadata> {
        match &self.source {
            UpdateItemSource::Files { entries, .. } => {
                entries.get(local as usize).and_then(|p| p.metadata().ok())
            }
            UpdateItemSource::StreamMap { .. } => self
                .snapshots
                .get(local as usize)
                .and_then(|snapshot| snapshot.metadata.clone()),
            _ => None,
        }
    }

    /// A timestamp from the item's file-system metadata, falling back to the
    /// current time when unavailable
    fn item_time(
        &self,
        local: u32,
        pick: impl Fn(&std::fs::Metadata) -> std::io::Result<std::time::SystemTime>,
    ) -> u64 {
        self.item_metadata(local)
            .and_then(|metadata| pick(&metadata).ok())
            .map(filetime_from_system)
            .unwrap_or_else(filetime_now)
    }

    /// Open the byte stream of item `index`, wrapped in a counting adapter
    /// feeding the progress aggregator. `Ok(None)` means the item has no
    /// data (directory). Emits the cancellable "item starting" notification
    /// before opening anything.
    pub fn open_stream(
        &mut self,
        index: u32,
    ) -> Result<Option<CountingReader<Box<dyn Read + Send>>>> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        let Some(local) = index.checked_sub(self.context.index_offset()) else {
            return Err(Error::InvalidArgument(format!(
                "stream request for index {} below the operation's offset",
                index
            )));
        };

        self.items_started += 1;
        let starting_percent =
            ((self.items_started * 100) / self.data_items.max(1)).min(100) as u8;
        let name = self.item_name(local);
        if let Some(events) = &self.events {
            let keep_going = events
                .lock()
                .map(|mut e| e.item_starting(&name, starting_percent))
                .unwrap_or(true);
            if !keep_going {
                self.cancelled = true;
                return Err(Error::Cancelled);
            }
        }

        let reader: Option<Box<dyn Read + Send>> = match &mut self.source {
            UpdateItemSource::Files { entries, .. } => {
                let Some(path) = entries.get(local as usize) else {
                    return Err(Error::InvalidArgument(format!(
                        "stream request for unknown item {}",
                        local
                    )));
                };
                if path.metadata().map(|m| m.is_dir()).unwrap_or(false) {
                    None
                } else {
                    // std::fs::File opens with shared read on every platform,
                    // so concurrent readers of the same file are tolerated
                    match std::fs::File::open(path) {
                        Ok(file) => Some(Box::new(file)),
                        Err(source) => {
                            return Err(Error::ItemResolution {
                                item: path.to_string_lossy().into_owned(),
                                source,
                            });
                        }
                    }
                }
            }
            UpdateItemSource::Stream { stream } => stream.take().map(|s| s as Box<dyn Read + Send>),
            UpdateItemSource::StreamMap { entries } => match entries.get_mut(local as usize) {
                Some(StreamMapEntry { stream, .. }) => {
                    stream.take().map(|s| s as Box<dyn Read + Send>)
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "stream request for unknown item {}",
                        local
                    )));
                }
            },
            UpdateItemSource::Existing => None,
        };

        Ok(reader.map(|r| CountingReader::new(r, Arc::clone(&self.progress))))
    }

    /// Keep `guard` alive until [`report_outcome`](Self::report_outcome)
    /// releases it (or defers it to operation teardown)
    pub(crate) fn register_open_stream(&mut self, guard: Box<dyn Any + Send>) {
        self.current_stream = Some(guard);
    }

    /// Record the engine's per-item outcome and release the just-used stream.
    /// Emits the "item finished" notification exactly once per item.
    pub fn report_outcome(&mut self, result: OperationResult) {
        match result {
            OperationResult::Ok => {}
            other => self.capture(Error::Operation { result: other }),
        }
        if let Some(guard) = self.current_stream.take() {
            if self.defer_stream_release {
                // Engine semantics for this format forbid closing the stream
                // before the whole operation ends.
                self.deferred_streams.push(guard);
            }
            // otherwise the guard drops here
        }
        if let Some(events) = &self.events {
            if let Ok(mut events) = events.lock() {
                events.item_finished();
            }
        }
    }

    /// Whether a password was configured, and its value
    pub fn password_query(&self) -> (bool, &str) {
        match &self.password {
            Some(password) if !password.is_empty() => (true, password.as_str()),
            _ => (false, ""),
        }
    }
}

impl Drop for ArchiveUpdateCallback {
    fn drop(&mut self) {
        // Operation-scoped cleanup: anything the engine left open is drained
        // here, including on aborted operations that skipped report_outcome.
        self.current_stream = None;
        self.deferred_streams.clear();
    }
}

// ---------------------------------------------------------------------------
// Raw callback objects handed to the engine
// ---------------------------------------------------------------------------

/// Heap layout handed to the engine: the interface struct must come first so
/// the engine's `this` pointer doubles as a pointer to the whole object.
#[repr(C)]
struct RawUpdateCallback {
    iface: sys::IArchiveUpdateCallback,
    state: Mutex<ArchiveUpdateCallback>,
}

/// Recover the state mutex behind an engine `this` pointer
///
/// # Safety
/// `this` must point at a live `RawUpdateCallback` created by `run_update`.
unsafe fn callback_state<'a>(
    this: *mut sys::IArchiveUpdateCallback,
) -> Option<MutexGuard<'a, ArchiveUpdateCallback>> {
    if this.is_null() {
        return None;
    }
    // SAFETY: iface is the first field of repr(C) RawUpdateCallback
    let raw = unsafe { &*(this as *const RawUpdateCallback) };
    raw.state.lock().ok()
}

unsafe extern "C" fn set_total_impl(
    _this: *mut sys::IArchiveUpdateCallback,
    _total: u64,
) -> sys::HRESULT {
    sys::S_OK
}

unsafe extern "C" fn set_completed_impl(
    _this: *mut sys::IArchiveUpdateCallback,
    _completed: *const u64,
) -> sys::HRESULT {
    sys::S_OK
}

unsafe extern "C" fn get_update_item_info_impl(
    this: *mut sys::IArchiveUpdateCallback,
    index: u32,
    new_data: *mut i32,
    new_properties: *mut i32,
    index_in_archive: *mut u32,
) -> sys::HRESULT {
    let Some(state) = (unsafe { callback_state(this) }) else {
        return sys::E_FAIL;
    };
    let disposition = state.item_disposition(index);
    unsafe {
        if !new_data.is_null() {
            *new_data = disposition.needs_new_data as i32;
        }
        if !new_properties.is_null() {
            *new_properties = disposition.needs_new_properties as i32;
        }
        if !index_in_archive.is_null() {
            *index_in_archive = disposition.index_in_archive;
        }
    }
    sys::S_OK
}

unsafe extern "C" fn get_property_impl(
    this: *mut sys::IArchiveUpdateCallback,
    index: u32,
    prop_id: u32,
    value: *mut sys::PropVariant,
) -> sys::HRESULT {
    if value.is_null() {
        return sys::E_INVALIDARG;
    }
    let Some(mut state) = (unsafe { callback_state(this) }) else {
        return sys::E_FAIL;
    };
    let resolved = match PropertyId::from_raw(prop_id) {
        Some(prop) => state.property(index, prop),
        // Unknown properties resolve to empty rather than aborting the run
        None => PropertyValue::Empty,
    };
    unsafe { resolved.write_into(value) };
    sys::S_OK
}

unsafe extern "C" fn get_stream_impl(
    this: *mut sys::IArchiveUpdateCallback,
    index: u32,
    in_stream: *mut *mut sys::ISequentialInStream,
) -> sys::HRESULT {
    if in_stream.is_null() {
        return sys::E_INVALIDARG;
    }
    let Some(mut state) = (unsafe { callback_state(this) }) else {
        return sys::E_FAIL;
    };
    match state.open_stream(index) {
        Ok(Some(reader)) => {
            let raw = Box::into_raw(Box::new(RawInStream {
                iface: sys::ISequentialInStream {
                    vtbl: &IN_STREAM_VTBL,
                },
                reader: Mutex::new(reader),
            }));
            state.register_open_stream(Box::new(RawStreamGuard(raw)));
            unsafe { *in_stream = raw as *mut sys::ISequentialInStream };
            sys::S_OK
        }
        Ok(None) => {
            unsafe { *in_stream = std::ptr::null_mut() };
            sys::S_OK
        }
        Err(Error::Cancelled) => sys::E_ABORT,
        Err(error) => {
            state.capture(error);
            sys::E_ABORT
        }
    }
}

unsafe extern "C" fn set_operation_result_impl(
    this: *mut sys::IArchiveUpdateCallback,
    op_result: i32,
) -> sys::HRESULT {
    let Some(mut state) = (unsafe { callback_state(this) }) else {
        return sys::E_FAIL;
    };
    state.report_outcome(OperationResult::from_code(op_result));
    sys::S_OK
}

unsafe extern "C" fn crypto_get_text_password2_impl(
    this: *mut sys::IArchiveUpdateCallback,
    is_defined: *mut i32,
    password: *mut *mut std::os::raw::c_char,
) -> sys::HRESULT {
    let Some(state) = (unsafe { callback_state(this) }) else {
        return sys::E_FAIL;
    };
    let (defined, value) = state.password_query();
    unsafe {
        if !is_defined.is_null() {
            *is_defined = defined as i32;
        }
        if !password.is_null() {
            *password = malloc_c_string(value);
        }
    }
    sys::S_OK
}

unsafe extern "C" fn enum_properties_impl(
    _this: *mut sys::IArchiveUpdateCallback,
    _enumerator: *mut c_void,
) -> sys::HRESULT {
    sys::E_NOTIMPL
}

static UPDATE_CALLBACK_VTBL: sys::IArchiveUpdateCallbackVtbl = sys::IArchiveUpdateCallbackVtbl {
    set_total: set_total_impl,
    set_completed: set_completed_impl,
    get_update_item_info: get_update_item_info_impl,
    get_property: get_property_impl,
    get_stream: get_stream_impl,
    set_operation_result: set_operation_result_impl,
    crypto_get_text_password2: crypto_get_text_password2_impl,
    enum_properties: enum_properties_impl,
};

/// Input stream object the engine reads an item through
#[repr(C)]
struct RawInStream {
    iface: sys::ISequentialInStream,
    reader: Mutex<CountingReader<Box<dyn Read + Send>>>,
}

unsafe extern "C" fn in_stream_read_impl(
    this: *mut sys::ISequentialInStream,
    data: *mut c_void,
    size: u32,
    processed: *mut u32,
) -> sys::HRESULT {
    if this.is_null() || data.is_null() {
        return sys::E_INVALIDARG;
    }
    // SAFETY: iface is the first field of repr(C) RawInStream
    let raw = unsafe { &*(this as *const RawInStream) };
    let Ok(mut reader) = raw.reader.lock() else {
        return sys::E_FAIL;
    };
    let buf = unsafe { std::slice::from_raw_parts_mut(data as *mut u8, size as usize) };
    match reader.read(buf) {
        Ok(n) => {
            if !processed.is_null() {
                unsafe { *processed = n as u32 };
            }
            sys::S_OK
        }
        Err(_) => sys::E_FAIL,
    }
}

unsafe extern "C" fn in_stream_release_impl(_this: *mut sys::ISequentialInStream) -> u32 {
    // Ownership stays with the callback's cleanup list; the engine's release
    // is accepted and ignored so an engine that over-releases cannot
    // double-free.
    0
}

static IN_STREAM_VTBL: sys::ISequentialInStreamVtbl = sys::ISequentialInStreamVtbl {
    read: in_stream_read_impl,
    release: in_stream_release_impl,
};

/// Owner of a raw stream allocation; dropping it frees the object
struct RawStreamGuard(*mut RawInStream);

// The guard only moves between fields of the callback state, which the
// engine drives from a single thread; the pointer is never dereferenced
// off-thread.
unsafe impl Send for RawStreamGuard {}

impl Drop for RawStreamGuard {
    fn drop(&mut self) {
        // SAFETY: the pointer came from Box::into_raw in get_stream_impl and
        // is dropped exactly once (Drop consumes the only owner)
        unsafe { drop(Box::from_raw(self.0)) };
    }
}

/// Output stream object the engine writes the archive into
#[repr(C)]
struct RawOutStream<W: Write + Send> {
    iface: sys::ISequentialOutStream,
    writer: Mutex<W>,
}

unsafe extern "C" fn out_stream_write_impl<W: Write + Send>(
    this: *mut sys::ISequentialOutStream,
    data: *const c_void,
    size: u32,
    processed: *mut u32,
) -> sys::HRESULT {
    if this.is_null() || data.is_null() {
        return sys::E_INVALIDARG;
    }
    // SAFETY: iface is the first field of repr(C) RawOutStream<W>
    let raw = unsafe { &*(this as *const RawOutStream<W>) };
    let Ok(mut writer) = raw.writer.lock() else {
        return sys::E_FAIL;
    };
    let buf = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
    match writer.write_all(buf) {
        Ok(()) => {
            if !processed.is_null() {
                unsafe { *processed = size };
            }
            sys::S_OK
        }
        Err(_) => sys::E_FAIL,
    }
}

unsafe extern "C" fn out_stream_release_impl(_this: *mut sys::ISequentialOutStream) -> u32 {
    0
}

/// Drive one archive-write operation: hands `callback` and `output` to the
/// engine object behind `archive` and blocks until the engine finishes.
///
/// Errors captured during the run (item resolution failures, non-success
/// per-item outcomes) are surfaced here, after control returns from the
/// engine; the first captured error wins. Returns the output writer so
/// callers can recover in-memory destinations.
pub fn run_update<W: Write + Send>(
    archive: &NativeInterfaceHandle,
    output: W,
    callback: ArchiveUpdateCallback,
) -> Result<W> {
    let num_items = callback.presented_item_count();

    let out_vtbl = sys::ISequentialOutStreamVtbl {
        write: out_stream_write_impl::<W>,
        release: out_stream_release_impl,
    };
    let raw_out = Box::into_raw(Box::new(RawOutStream {
        iface: sys::ISequentialOutStream {
            vtbl: &raw const out_vtbl,
        },
        writer: Mutex::new(output),
    }));
    let raw_callback = Box::into_raw(Box::new(RawUpdateCallback {
        iface: sys::IArchiveUpdateCallback {
            vtbl: &UPDATE_CALLBACK_VTBL,
        },
        state: Mutex::new(callback),
    }));

    // SAFETY: archive holds a live IOutArchive for the duration of the call;
    // both raw objects outlive it and are reclaimed below on every path.
    let hresult = unsafe {
        let out_archive = archive.as_ptr() as *mut sys::IOutArchive;
        ((*(*out_archive).vtbl).update_items)(
            out_archive as *mut c_void,
            raw_out as *mut sys::ISequentialOutStream,
            num_items,
            raw_callback as *mut sys::IArchiveUpdateCallback,
        )
    };

    // SAFETY: the engine has returned; we are the only owners again
    let raw_callback = unsafe { Box::from_raw(raw_callback) };
    let raw_out = unsafe { Box::from_raw(raw_out) };

    let mut state = raw_callback
        .state
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let cancelled = state.cancelled();
    let mut errors = state.take_errors();
    drop(state);

    let writer = raw_out
        .writer
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if cancelled {
        return Err(Error::Cancelled);
    }
    if !errors.is_empty() {
        return Err(errors.remove(0));
    }
    Error::from_hresult(hresult)?;
    Ok(writer)
}
