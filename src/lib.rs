//! Safe Rust driver for a dynamically loaded 7-Zip engine module
//!
//! The engine ships as a closed shared library that pulls archive metadata
//! and data through a caller-supplied callback object. This crate keeps the
//! module loaded exactly while someone uses it, answers the engine's per-item
//! callback sequence from safe Rust data sources, and turns raw byte counts
//! into clean progress events.
//!
//! # Example
//!
//! ```no_run
//! use sevenzip2::{
//!     ArchiveUpdateCallback, CallerId, LibraryManager, OutArchiveFormat, UpdateContext,
//!     UpdateItemSource, run_update,
//! };
//!
//! fn main() -> sevenzip2::Result<()> {
//!     let manager = LibraryManager::new("/usr/lib/7zip/7z.so");
//!     let caller = CallerId::next();
//!     let archive = manager.interface_for(caller, OutArchiveFormat::SevenZip)?;
//!
//!     let source = UpdateItemSource::files(vec!["notes.txt".into(), "photos".into()]);
//!     let callback = ArchiveUpdateCallback::new(source, UpdateContext::create())
//!         .output_format(OutArchiveFormat::SevenZip);
//!
//!     let output = std::fs::File::create("backup.7z")?;
//!     run_update(&archive, output, callback)?;
//!     manager.unregister(caller, OutArchiveFormat::SevenZip);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

mod error;
mod format;
mod library;
mod progress;
mod property;
mod source;
mod update;

pub use error::{Error, OperationResult, Result};
pub use format::{ArchiveFormat, InArchiveFormat, OutArchiveFormat};
pub use library::{
    CallerId, DynamicLoader, EngineLoader, EngineModule, FeatureSet, LibraryManager,
    NativeInterfaceHandle,
};
pub use progress::{CountingReader, ProgressAggregator, ProgressCallback};
pub use property::{
    ATTR_DIRECTORY, ATTR_NORMAL, ATTR_READONLY, PropertyId, PropertyValue, filetime_from_system,
    filetime_now,
};
pub use source::{
    ExistingItem, InStream, StreamMapEntry, UpdateContext, UpdateItemSource, UpdateMode,
};
pub use update::{ArchiveUpdateCallback, Disposition, UpdateEvents, run_update};
