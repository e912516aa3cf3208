//! Low-level ABI definitions for the dynamically loaded 7-Zip engine module.
//!
//! The engine is a closed shared library resolved at runtime; nothing here is
//! linked at build time. These declarations mirror the engine's C-flattened
//! COM surface: every object created by the engine starts with a vtable whose
//! first slot releases the object, and all calls report an `HRESULT`.

#![deny(missing_docs)]

use std::os::raw::{c_char, c_void};

/// COM-style result code. Zero is success, negative values are failures.
pub type HRESULT = i32;

/// Operation completed successfully.
pub const S_OK: HRESULT = 0;
/// Operation completed with a non-fatal condition.
pub const S_FALSE: HRESULT = 1;
/// The requested slot is not implemented.
pub const E_NOTIMPL: HRESULT = 0x8000_4001_u32 as i32;
/// The operation was aborted by the callback.
pub const E_ABORT: HRESULT = 0x8000_4004_u32 as i32;
/// Unspecified failure.
pub const E_FAIL: HRESULT = 0x8000_4005_u32 as i32;
/// An argument was invalid.
pub const E_INVALIDARG: HRESULT = 0x8007_0057_u32 as i32;

/// Binary GUID as the engine expects it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GUID {
    /// First component.
    pub data1: u32,
    /// Second component.
    pub data2: u16,
    /// Third component.
    pub data3: u16,
    /// Final eight bytes.
    pub data4: [u8; 8],
}

/// Interface id of the engine's archive reader interface.
pub const IID_IIN_ARCHIVE: GUID = GUID {
    data1: 0x2317_0F69,
    data2: 0x40C1,
    data3: 0x278A,
    data4: [0x00, 0x00, 0x00, 0x06, 0x00, 0x60, 0x00, 0x00],
};

/// Interface id of the engine's archive writer interface.
pub const IID_IOUT_ARCHIVE: GUID = GUID {
    data1: 0x2317_0F69,
    data2: 0x40C1,
    data3: 0x278A,
    data4: [0x00, 0x00, 0x00, 0x06, 0x00, 0xA0, 0x00, 0x00],
};

/// Builds the class id of an archive format handler from its published
/// one-byte format identifier.
pub const fn format_clsid(id: u8) -> GUID {
    GUID {
        data1: 0x2317_0F69,
        data2: 0x40C1,
        data3: 0x278A,
        data4: [0x10, 0x00, 0x00, 0x01, 0x10, id, 0x00, 0x00],
    }
}

/// `VT_EMPTY`: no value.
pub const VT_EMPTY: u16 = 0;
/// `VT_BSTR`: string value (marshalled as a `malloc`-owned C string).
pub const VT_BSTR: u16 = 8;
/// `VT_BOOL`: VARIANT_BOOL value, 0 or -1.
pub const VT_BOOL: u16 = 11;
/// `VT_UI4`: unsigned 32-bit value.
pub const VT_UI4: u16 = 19;
/// `VT_UI8`: unsigned 64-bit value.
pub const VT_UI8: u16 = 21;
/// `VT_FILETIME`: Windows file time, 100 ns ticks since 1601-01-01.
pub const VT_FILETIME: u16 = 64;

/// `kpidPath`.
pub const KPID_PATH: u32 = 3;
/// `kpidName`.
pub const KPID_NAME: u32 = 4;
/// `kpidExtension`.
pub const KPID_EXTENSION: u32 = 5;
/// `kpidIsDir`.
pub const KPID_IS_DIR: u32 = 6;
/// `kpidSize`.
pub const KPID_SIZE: u32 = 7;
/// `kpidAttrib`.
pub const KPID_ATTRIB: u32 = 9;
/// `kpidCTime`.
pub const KPID_CTIME: u32 = 10;
/// `kpidATime`.
pub const KPID_ATIME: u32 = 11;
/// `kpidMTime`.
pub const KPID_MTIME: u32 = 12;
/// `kpidIsAnti`.
pub const KPID_IS_ANTI: u32 = 21;
/// Engine extension: full source path of an item being compressed.
pub const KPID_SOURCE_PATH: u32 = 0xD001;

/// Per-item result code passed to `set_operation_result`: success.
pub const OP_RESULT_OK: i32 = 0;
/// Per-item result code: the compression method is not supported.
pub const OP_RESULT_UNSUPPORTED_METHOD: i32 = 1;
/// Per-item result code: the data is corrupted.
pub const OP_RESULT_DATA_ERROR: i32 = 2;
/// Per-item result code: checksum mismatch.
pub const OP_RESULT_CRC_ERROR: i32 = 3;

/// Sentinel archive index meaning "this item is new, not a copy of an
/// existing archive entry".
pub const INDEX_NEW_ITEM: u32 = u32::MAX;

/// Payload of a [`PropVariant`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union PropVariantData {
    /// `VT_BOOL` payload.
    pub bool_val: i16,
    /// `VT_UI4` payload.
    pub u32_val: u32,
    /// `VT_UI8` payload.
    pub u64_val: u64,
    /// `VT_FILETIME` payload.
    pub filetime: u64,
    /// `VT_BSTR` payload: `malloc`-owned C string, freed by the engine.
    pub str_val: *mut c_char,
}

/// Tagged value crossing the property boundary in either direction.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PropVariant {
    /// `VT_*` discriminant.
    pub vt: u16,
    /// Layout padding, always zero.
    pub reserved: [u16; 3],
    /// Payload selected by `vt`.
    pub value: PropVariantData,
}

impl PropVariant {
    /// An empty (`VT_EMPTY`) variant.
    pub const fn empty() -> Self {
        PropVariant {
            vt: VT_EMPTY,
            reserved: [0; 3],
            value: PropVariantData { u64_val: 0 },
        }
    }
}

impl Default for PropVariant {
    fn default() -> Self {
        Self::empty()
    }
}

/// Leading vtable slot shared by every object the engine creates. Casting an
/// engine object pointer to `*const EngineObject` is always valid.
#[repr(C)]
pub struct EngineObjectVtbl {
    /// Releases the object. Returns the remaining reference count.
    pub release: unsafe extern "C" fn(this: *mut c_void) -> u32,
}

/// Prefix view of any engine-created object.
#[repr(C)]
pub struct EngineObject {
    /// The object's vtable.
    pub vtbl: *const EngineObjectVtbl,
}

/// Function table of a sequential input stream handed to the engine.
#[repr(C)]
pub struct ISequentialInStreamVtbl {
    /// Reads up to `size` bytes into `data`; stores the byte count read in
    /// `processed`. Zero bytes processed signals end of stream.
    pub read: unsafe extern "C" fn(
        this: *mut ISequentialInStream,
        data: *mut c_void,
        size: u32,
        processed: *mut u32,
    ) -> HRESULT,
    /// Releases the engine's reference to the stream.
    pub release: unsafe extern "C" fn(this: *mut ISequentialInStream) -> u32,
}

/// A sequential input stream object.
#[repr(C)]
pub struct ISequentialInStream {
    /// The stream's vtable.
    pub vtbl: *const ISequentialInStreamVtbl,
}

/// Function table of a sequential output stream handed to the engine.
#[repr(C)]
pub struct ISequentialOutStreamVtbl {
    /// Writes `size` bytes from `data`; stores the byte count written in
    /// `processed`.
    pub write: unsafe extern "C" fn(
        this: *mut ISequentialOutStream,
        data: *const c_void,
        size: u32,
        processed: *mut u32,
    ) -> HRESULT,
    /// Releases the engine's reference to the stream.
    pub release: unsafe extern "C" fn(this: *mut ISequentialOutStream) -> u32,
}

/// A sequential output stream object.
#[repr(C)]
pub struct ISequentialOutStream {
    /// The stream's vtable.
    pub vtbl: *const ISequentialOutStreamVtbl,
}

/// Function table the engine drives during one archive-write operation.
///
/// The engine invokes these synchronously and sequentially from a single
/// thread, in index-ascending order. Every slot returns an `HRESULT`; any
/// nonzero value aborts the operation.
#[repr(C)]
pub struct IArchiveUpdateCallbackVtbl {
    /// Announces the declared total byte count. Accepted, no-op.
    pub set_total: unsafe extern "C" fn(this: *mut IArchiveUpdateCallback, total: u64) -> HRESULT,
    /// Announces bytes completed so far. Accepted, no-op.
    pub set_completed: unsafe extern "C" fn(
        this: *mut IArchiveUpdateCallback,
        completed: *const u64,
    ) -> HRESULT,
    /// Asks whether item `index` carries new data and/or new properties, and
    /// which existing archive index it maps to ([`INDEX_NEW_ITEM`] for new
    /// items).
    pub get_update_item_info: unsafe extern "C" fn(
        this: *mut IArchiveUpdateCallback,
        index: u32,
        new_data: *mut i32,
        new_properties: *mut i32,
        index_in_archive: *mut u32,
    ) -> HRESULT,
    /// Resolves one property of item `index` into `value`.
    pub get_property: unsafe extern "C" fn(
        this: *mut IArchiveUpdateCallback,
        index: u32,
        prop_id: u32,
        value: *mut PropVariant,
    ) -> HRESULT,
    /// Opens the byte stream of item `index`. A null stream with `S_OK`
    /// means the item has no data (directory).
    pub get_stream: unsafe extern "C" fn(
        this: *mut IArchiveUpdateCallback,
        index: u32,
        in_stream: *mut *mut ISequentialInStream,
    ) -> HRESULT,
    /// Reports the engine's per-item outcome (`OP_RESULT_*`).
    pub set_operation_result:
        unsafe extern "C" fn(this: *mut IArchiveUpdateCallback, op_result: i32) -> HRESULT,
    /// Asks whether a password is configured. `password` receives a
    /// `malloc`-owned C string freed by the engine.
    pub crypto_get_text_password2: unsafe extern "C" fn(
        this: *mut IArchiveUpdateCallback,
        is_defined: *mut i32,
        password: *mut *mut c_char,
    ) -> HRESULT,
    /// Hands out a property enumerator. Callbacks may answer [`E_NOTIMPL`].
    pub enum_properties:
        unsafe extern "C" fn(this: *mut IArchiveUpdateCallback, enumerator: *mut c_void) -> HRESULT,
}

/// The update callback object handed to [`IOutArchiveVtbl::update_items`].
#[repr(C)]
pub struct IArchiveUpdateCallback {
    /// The callback's vtable.
    pub vtbl: *const IArchiveUpdateCallbackVtbl,
}

/// Function table of an engine-created archive writer object.
#[repr(C)]
pub struct IOutArchiveVtbl {
    /// Releases the writer. Returns the remaining reference count.
    pub release: unsafe extern "C" fn(this: *mut c_void) -> u32,
    /// Writes `num_items` items into `out_stream`, pulling metadata and data
    /// through `callback`.
    pub update_items: unsafe extern "C" fn(
        this: *mut c_void,
        out_stream: *mut ISequentialOutStream,
        num_items: u32,
        callback: *mut IArchiveUpdateCallback,
    ) -> HRESULT,
}

/// An engine-created archive writer object.
#[repr(C)]
pub struct IOutArchive {
    /// The writer's vtable.
    pub vtbl: *const IOutArchiveVtbl,
}

/// `CreateObject` entry point: instantiates a format handler by class id.
pub type CreateObjectFn = unsafe extern "C" fn(
    class_id: *const GUID,
    interface_id: *const GUID,
    out_object: *mut *mut c_void,
) -> HRESULT;

/// `GetHandlerProperty` entry point: queries a global engine property. Its
/// presence is what distinguishes a real engine module from an arbitrary
/// shared library.
pub type GetHandlerPropertyFn =
    unsafe extern "C" fn(prop_id: u32, value: *mut PropVariant) -> HRESULT;

/// Symbol name of [`CreateObjectFn`].
pub const FN_CREATE_OBJECT: &[u8] = b"CreateObject";
/// Symbol name of [`GetHandlerPropertyFn`].
pub const FN_GET_HANDLER_PROPERTY: &[u8] = b"GetHandlerProperty";
