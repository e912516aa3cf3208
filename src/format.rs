//! Archive format and compression method definitions

use sevenzip2_sys::{GUID, format_clsid};

/// Formats the engine can open for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InArchiveFormat {
    /// 7-Zip format
    SevenZip,
    /// ZIP format
    Zip,
    /// GZip format
    GZip,
    /// BZip2 format
    BZip2,
    /// TAR format
    Tar,
    /// RAR format
    Rar,
    /// XZ format
    Xz,
    /// Raw LZMA stream
    Lzma,
    /// Microsoft CAB format
    Cab,
    /// ISO 9660 CD-ROM image
    Iso,
}

/// Formats the engine can produce or update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutArchiveFormat {
    /// 7-Zip format
    SevenZip,
    /// ZIP format
    Zip,
    /// GZip format
    GZip,
    /// BZip2 format
    BZip2,
    /// TAR format
    Tar,
    /// XZ format
    Xz,
}

/// Either side of the format split, carried explicitly through the call chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// A format requested for reading
    In(InArchiveFormat),
    /// A format requested for writing
    Out(OutArchiveFormat),
}

impl InArchiveFormat {
    /// Class id of the engine's handler for this format
    pub fn class_id(&self) -> GUID {
        match self {
            InArchiveFormat::SevenZip => format_clsid(0x07),
            InArchiveFormat::Zip => format_clsid(0x01),
            InArchiveFormat::GZip => format_clsid(0xEF),
            InArchiveFormat::BZip2 => format_clsid(0x02),
            InArchiveFormat::Tar => format_clsid(0xEE),
            InArchiveFormat::Rar => format_clsid(0x03),
            InArchiveFormat::Xz => format_clsid(0x0C),
            InArchiveFormat::Lzma => format_clsid(0x0A),
            InArchiveFormat::Cab => format_clsid(0x08),
            InArchiveFormat::Iso => format_clsid(0xE7),
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            InArchiveFormat::SevenZip => "7z",
            InArchiveFormat::Zip => "zip",
            InArchiveFormat::GZip => "gzip",
            InArchiveFormat::BZip2 => "bzip2",
            InArchiveFormat::Tar => "tar",
            InArchiveFormat::Rar => "rar",
            InArchiveFormat::Xz => "xz",
            InArchiveFormat::Lzma => "lzma",
            InArchiveFormat::Cab => "cab",
            InArchiveFormat::Iso => "iso",
        }
    }
}

impl OutArchiveFormat {
    /// Class id of the engine's handler for this format
    pub fn class_id(&self) -> GUID {
        match self {
            OutArchiveFormat::SevenZip => format_clsid(0x07),
            OutArchiveFormat::Zip => format_clsid(0x01),
            OutArchiveFormat::GZip => format_clsid(0xEF),
            OutArchiveFormat::BZip2 => format_clsid(0x02),
            OutArchiveFormat::Tar => format_clsid(0xEE),
            OutArchiveFormat::Xz => format_clsid(0x0C),
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            OutArchiveFormat::SevenZip => "7z",
            OutArchiveFormat::Zip => "zip",
            OutArchiveFormat::GZip => "gzip",
            OutArchiveFormat::BZip2 => "bzip2",
            OutArchiveFormat::Tar => "tar",
            OutArchiveFormat::Xz => "xz",
        }
    }

    /// Whether the engine forbids closing item streams before the whole
    /// operation ends for this format, forcing deferred release
    pub(crate) fn holds_streams_until_end(&self) -> bool {
        matches!(self, OutArchiveFormat::Zip)
    }
}

impl ArchiveFormat {
    /// Class id of the engine's handler for this format
    pub fn class_id(&self) -> GUID {
        match self {
            ArchiveFormat::In(format) => format.class_id(),
            ArchiveFormat::Out(format) => format.class_id(),
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::In(format) => format.name(),
            ArchiveFormat::Out(format) => format.name(),
        }
    }

    /// Interface id the engine must hand back for this side of the split
    pub(crate) fn interface_id(&self) -> GUID {
        match self {
            ArchiveFormat::In(_) => sevenzip2_sys::IID_IIN_ARCHIVE,
            ArchiveFormat::Out(_) => sevenzip2_sys::IID_IOUT_ARCHIVE,
        }
    }
}

impl From<InArchiveFormat> for ArchiveFormat {
    fn from(format: InArchiveFormat) -> Self {
        ArchiveFormat::In(format)
    }
}

impl From<OutArchiveFormat> for ArchiveFormat {
    fn from(format: OutArchiveFormat) -> Self {
        ArchiveFormat::Out(format)
    }
}
