//! Data sources and per-operation context for archive updates

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Byte stream usable as item data. Seeking is required so declared sizes can
/// be computed up front, as the engine asks for item sizes before data.
pub trait InStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> InStream for T {}

/// Kind of archive-write operation. Fixed for the lifetime of one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Write a fresh archive
    Create,
    /// Keep all existing items and add new ones after them
    Append,
    /// Rename or delete existing items without re-supplying data
    Modify,
}

/// One entry of a name→stream map. A `None` stream marks a directory entry.
pub struct StreamMapEntry {
    pub(crate) name: String,
    pub(crate) stream: Option<Box<dyn InStream>>,
    pub(crate) source_path: Option<PathBuf>,
}

impl StreamMapEntry {
    /// Create a map entry; pass `None` for a directory entry
    pub fn new(name: impl Into<String>, stream: Option<Box<dyn InStream>>) -> Self {
        StreamMapEntry {
            name: name.into(),
            stream,
            source_path: None,
        }
    }

    /// Record the file-system path backing this stream so file metadata can
    /// be used for its properties
    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

/// Where item data and metadata come from for one update operation.
/// Exactly one variant is populated; immutable once constructed.
pub enum UpdateItemSource {
    /// A list of file-system entries
    Files {
        /// Paths to pack, directories included
        entries: Vec<PathBuf>,
        /// Optional per-entry replacement archive names
        alt_names: Option<Vec<Option<String>>>,
        /// Byte length of the common root prefix stripped from paths when
        /// preserving directory structure
        common_root_len: usize,
    },
    /// A single input stream
    Stream {
        /// The stream; taken when the engine requests item data
        stream: Option<Box<dyn InStream>>,
    },
    /// A name→stream map
    StreamMap {
        /// Map entries in archive order
        entries: Vec<StreamMapEntry>,
    },
    /// No new data; metadata comes from the existing archive (Modify mode)
    Existing,
}

impl UpdateItemSource {
    /// Source backed by a plain list of file-system paths
    pub fn files(entries: Vec<PathBuf>) -> Self {
        UpdateItemSource::Files {
            entries,
            alt_names: None,
            common_root_len: 0,
        }
    }

    /// Source backed by a single stream
    pub fn stream(stream: Box<dyn InStream>) -> Self {
        UpdateItemSource::Stream {
            stream: Some(stream),
        }
    }

    /// Source backed by a name→stream map
    pub fn stream_map(entries: Vec<StreamMapEntry>) -> Self {
        UpdateItemSource::StreamMap { entries }
    }

    /// Number of new items this source contributes
    pub(crate) fn item_count(&self) -> usize {
        match self {
            UpdateItemSource::Files { entries, .. } => entries.len(),
            UpdateItemSource::Stream { .. } => 1,
            UpdateItemSource::StreamMap { entries } => entries.len(),
            UpdateItemSource::Existing => 0,
        }
    }

    /// Number of items that carry data (directories excluded), used for the
    /// per-item share of the "item starting" percent
    pub(crate) fn data_item_count(&self) -> usize {
        match self {
            UpdateItemSource::Files { entries, .. } => entries
                .iter()
                .filter(|path| path.metadata().map(|m| !m.is_dir()).unwrap_or(false))
                .count(),
            UpdateItemSource::Stream { .. } => 1,
            UpdateItemSource::StreamMap { entries } => {
                entries.iter().filter(|e| e.stream.is_some()).count()
            }
            UpdateItemSource::Existing => 0,
        }
    }

    /// Measure declared sizes for progress accounting. Returns the total
    /// byte count plus per-entry snapshots for stream-backed variants;
    /// file-backed entries are re-statted on demand instead. Unreadable
    /// entries contribute nothing; the open path reports them properly later.
    pub(crate) fn measure(&mut self) -> (u64, Vec<ItemSnapshot>) {
        match self {
            UpdateItemSource::Files { entries, .. } => {
                let total = entries
                    .iter()
                    .filter_map(|path| path.metadata().ok())
                    .filter(|m| !m.is_dir())
                    .map(|m| m.len())
                    .sum();
                (total, Vec::new())
            }
            UpdateItemSource::Stream { stream } => {
                let size = stream
                    .as_mut()
                    .and_then(|s| stream_len(s.as_mut()))
                    .unwrap_or(0);
                (
                    size,
                    vec![ItemSnapshot {
                        is_directory: false,
                        size,
                        metadata: None,
                    }],
                )
            }
            UpdateItemSource::StreamMap { entries } => {
                let mut total = 0u64;
                let mut snapshots = Vec::with_capacity(entries.len());
                for entry in entries.iter_mut() {
                    let size = entry
                        .stream
                        .as_mut()
                        .and_then(|s| stream_len(s.as_mut()))
                        .unwrap_or(0);
                    total += size;
                    snapshots.push(ItemSnapshot {
                        is_directory: entry.stream.is_none(),
                        size,
                        metadata: entry
                            .source_path
                            .as_ref()
                            .and_then(|p| std::fs::metadata(p).ok()),
                    });
                }
                (total, snapshots)
            }
            UpdateItemSource::Existing => (0, Vec::new()),
        }
    }
}

/// Point-in-time measurement of one stream-backed entry, taken before the
/// engine starts asking questions: stream sizes are seek-measured once and
/// mapped file metadata is snapshotted so property queries stay answerable
/// after streams are handed out
pub(crate) struct ItemSnapshot {
    pub(crate) is_directory: bool,
    pub(crate) size: u64,
    pub(crate) metadata: Option<std::fs::Metadata>,
}

/// Measures a stream by seeking to its end, then restores the start position
pub(crate) fn stream_len(stream: &mut dyn InStream) -> Option<u64> {
    let len = stream.seek(SeekFrom::End(0)).ok()?;
    stream.seek(SeekFrom::Start(0)).ok()?;
    Some(len)
}

/// Metadata of one item already present in the archive, used in Modify mode
#[derive(Debug, Clone)]
pub struct ExistingItem {
    /// Stored item name
    pub name: String,
    /// Stored uncompressed size
    pub size: u64,
    /// Stored attribute bits
    pub attributes: u32,
    /// Whether the stored item is a directory
    pub is_directory: bool,
    /// Stored creation time (Windows file time)
    pub creation_time: u64,
    /// Stored last access time (Windows file time)
    pub last_access_time: u64,
    /// Stored last write time (Windows file time)
    pub last_write_time: u64,
}

/// Per-operation context: mode, existing-archive shape and the rename map.
/// Created once per archive-write call and discarded at its end.
pub struct UpdateContext {
    /// The operation's mode
    pub mode: UpdateMode,
    /// Number of items already in the archive
    pub existing_count: u32,
    /// Modify-mode edits: index → new name, or `None` to delete the item
    pub rename_map: HashMap<u32, Option<String>>,
    /// Modify-mode metadata of existing items, indexed by archive position
    pub existing_items: Vec<ExistingItem>,
}

impl UpdateContext {
    /// Context for writing a fresh archive
    pub fn create() -> Self {
        UpdateContext {
            mode: UpdateMode::Create,
            existing_count: 0,
            rename_map: HashMap::new(),
            existing_items: Vec::new(),
        }
    }

    /// Context for appending to an archive that already holds
    /// `existing_count` items
    pub fn append(existing_count: u32) -> Self {
        UpdateContext {
            mode: UpdateMode::Append,
            existing_count,
            rename_map: HashMap::new(),
            existing_items: Vec::new(),
        }
    }

    /// Context for renaming or deleting items in place. A `None` value in
    /// `rename_map` is a tombstone deleting that index.
    pub fn modify(
        existing_items: Vec<ExistingItem>,
        rename_map: HashMap<u32, Option<String>>,
    ) -> Self {
        UpdateContext {
            mode: UpdateMode::Modify,
            existing_count: existing_items.len() as u32,
            rename_map,
            existing_items,
        }
    }

    /// Offset subtracted from engine indices to reach this operation's new
    /// items: existing-item-count for Append, zero otherwise
    pub(crate) fn index_offset(&self) -> u32 {
        match self.mode {
            UpdateMode::Append => self.existing_count,
            UpdateMode::Create | UpdateMode::Modify => 0,
        }
    }

    /// Number of tombstoned positions strictly below `index`
    pub(crate) fn tombstones_below(&self, index: u32) -> u32 {
        self.rename_map
            .iter()
            .filter(|(position, new_name)| **position < index && new_name.is_none())
            .count() as u32
    }

    /// Number of tombstoned positions inside the archive. Keys past the end
    /// of the archive cannot remove anything.
    pub(crate) fn tombstone_count(&self) -> u32 {
        self.tombstones_below(self.existing_count)
    }

    /// Size of the contiguous index range `[0, N)` this operation presents
    /// to the engine
    pub(crate) fn presented_item_count(&self, source_items: usize) -> u32 {
        match self.mode {
            UpdateMode::Create => source_items as u32,
            UpdateMode::Append => self.existing_count + source_items as u32,
            UpdateMode::Modify => self.existing_count - self.tombstone_count(),
        }
    }
}
