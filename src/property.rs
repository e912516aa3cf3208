//! Item property vocabulary and marshalling across the engine boundary

use std::os::raw::c_char;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sevenzip2_sys as sys;

/// `FILE_ATTRIBUTE_READONLY`
pub const ATTR_READONLY: u32 = 0x01;
/// `FILE_ATTRIBUTE_DIRECTORY`
pub const ATTR_DIRECTORY: u32 = 0x10;
/// `FILE_ATTRIBUTE_NORMAL`
pub const ATTR_NORMAL: u32 = 0x80;

/// Properties the engine may request for an item during an update operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyId {
    /// Item path inside the archive
    Path,
    /// Whether the item is a directory
    IsDirectory,
    /// Uncompressed size in bytes
    Size,
    /// Windows-style attribute bits
    Attributes,
    /// Creation time
    CreationTime,
    /// Last access time
    LastAccessTime,
    /// Last write time
    LastWriteTime,
    /// File name extension, without the dot
    Extension,
    /// Full file-system path the data comes from
    SourcePath,
    /// Whether the item is an anti-item (never produced here)
    IsAnti,
}

impl PropertyId {
    /// Decode the raw property id the engine passes across the boundary
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            sys::KPID_PATH => Some(PropertyId::Path),
            sys::KPID_IS_DIR => Some(PropertyId::IsDirectory),
            sys::KPID_SIZE => Some(PropertyId::Size),
            sys::KPID_ATTRIB => Some(PropertyId::Attributes),
            sys::KPID_CTIME => Some(PropertyId::CreationTime),
            sys::KPID_ATIME => Some(PropertyId::LastAccessTime),
            sys::KPID_MTIME => Some(PropertyId::LastWriteTime),
            sys::KPID_EXTENSION => Some(PropertyId::Extension),
            sys::KPID_SOURCE_PATH => Some(PropertyId::SourcePath),
            sys::KPID_IS_ANTI => Some(PropertyId::IsAnti),
            _ => None,
        }
    }

    /// Raw property id as the engine spells it
    pub fn raw(&self) -> u32 {
        match self {
            PropertyId::Path => sys::KPID_PATH,
            PropertyId::IsDirectory => sys::KPID_IS_DIR,
            PropertyId::Size => sys::KPID_SIZE,
            PropertyId::Attributes => sys::KPID_ATTRIB,
            PropertyId::CreationTime => sys::KPID_CTIME,
            PropertyId::LastAccessTime => sys::KPID_ATIME,
            PropertyId::LastWriteTime => sys::KPID_MTIME,
            PropertyId::Extension => sys::KPID_EXTENSION,
            PropertyId::SourcePath => sys::KPID_SOURCE_PATH,
            PropertyId::IsAnti => sys::KPID_IS_ANTI,
        }
    }
}

/// A resolved property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// No value
    Empty,
    /// Boolean value
    Bool(bool),
    /// String value
    Str(String),
    /// Unsigned 32-bit value
    U32(u32),
    /// Unsigned 64-bit value
    U64(u64),
    /// Windows file time, 100 ns ticks since 1601-01-01
    FileTime(u64),
}

impl PropertyValue {
    /// Marshal this value into an engine-owned variant. String payloads are
    /// copied into `malloc` storage which the engine frees.
    ///
    /// # Safety
    /// `out` must point at a writable `PropVariant`.
    pub(crate) unsafe fn write_into(&self, out: *mut sys::PropVariant) {
        let variant = match self {
            PropertyValue::Empty => sys::PropVariant::empty(),
            PropertyValue::Bool(b) => sys::PropVariant {
                vt: sys::VT_BOOL,
                reserved: [0; 3],
                value: sys::PropVariantData {
                    bool_val: if *b { -1 } else { 0 },
                },
            },
            PropertyValue::Str(s) => sys::PropVariant {
                vt: sys::VT_BSTR,
                reserved: [0; 3],
                value: sys::PropVariantData {
                    str_val: malloc_c_string(s),
                },
            },
            PropertyValue::U32(v) => sys::PropVariant {
                vt: sys::VT_UI4,
                reserved: [0; 3],
                value: sys::PropVariantData { u32_val: *v },
            },
            PropertyValue::U64(v) => sys::PropVariant {
                vt: sys::VT_UI8,
                reserved: [0; 3],
                value: sys::PropVariantData { u64_val: *v },
            },
            PropertyValue::FileTime(t) => sys::PropVariant {
                vt: sys::VT_FILETIME,
                reserved: [0; 3],
                value: sys::PropVariantData { filetime: *t },
            },
        };
        // SAFETY: caller guarantees out is valid for writes
        unsafe { out.write(variant) };
    }
}

/// Copies a UTF-8 string into `malloc` storage as a NUL-terminated C string.
/// Returns null if allocation fails; the engine treats null as an empty value.
pub(crate) fn malloc_c_string(s: &str) -> *mut c_char {
    let bytes = s.as_bytes();
    unsafe {
        let buf = libc::malloc(bytes.len() + 1) as *mut c_char;
        if buf.is_null() {
            return buf;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, bytes.len());
        *buf.add(bytes.len()) = 0;
        buf
    }
}

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Converts a `SystemTime` to Windows file time. Times before 1970 clamp to
/// the Unix epoch.
pub fn filetime_from_system(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            (FILETIME_UNIX_DIFF_SECS + elapsed.as_secs()) * FILETIME_TICKS_PER_SEC
                + u64::from(elapsed.subsec_nanos()) / 100
        }
        Err(_) => FILETIME_UNIX_DIFF_SECS * FILETIME_TICKS_PER_SEC,
    }
}

/// Windows file time of the current moment
pub fn filetime_now() -> u64 {
    filetime_from_system(SystemTime::now())
}

/// Extension of a path-like item name, without the dot. An extension-less
/// name yields an empty string, not an error.
pub(crate) fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Windows-style attribute bits for a file-system entry
pub(crate) fn attributes_from_metadata(metadata: &std::fs::Metadata) -> u32 {
    let mut attributes = if metadata.is_dir() {
        ATTR_DIRECTORY
    } else {
        ATTR_NORMAL
    };
    if metadata.permissions().readonly() {
        attributes |= ATTR_READONLY;
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_epoch() {
        assert_eq!(
            filetime_from_system(UNIX_EPOCH),
            FILETIME_UNIX_DIFF_SECS * FILETIME_TICKS_PER_SEC
        );
    }

    #[test]
    fn test_filetime_known_instant() {
        let time = UNIX_EPOCH + std::time::Duration::from_secs(86_400);
        let expected = (FILETIME_UNIX_DIFF_SECS + 86_400) * FILETIME_TICKS_PER_SEC;
        assert_eq!(filetime_from_system(time), expected);
    }

    #[test]
    fn test_property_id_raw_round_trip() {
        for id in [
            PropertyId::Path,
            PropertyId::IsDirectory,
            PropertyId::Size,
            PropertyId::Attributes,
            PropertyId::CreationTime,
            PropertyId::LastAccessTime,
            PropertyId::LastWriteTime,
            PropertyId::Extension,
            PropertyId::SourcePath,
            PropertyId::IsAnti,
        ] {
            assert_eq!(PropertyId::from_raw(id.raw()), Some(id));
        }
        assert_eq!(PropertyId::from_raw(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.txt"), "txt");
        assert_eq!(extension_of("dir/archive.tar.gz"), "gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".hidden"), "");
    }
}
