//! End-to-end tests driving the callback protocol the way the engine does,
//! through the raw function tables, against a scripted in-process engine.

use std::ffi::c_void;
use std::io::Write;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use sevenzip2::{
    ArchiveUpdateCallback, CallerId, EngineLoader, EngineModule, Error, FeatureSet,
    InArchiveFormat, LibraryManager, OutArchiveFormat, Result, StreamMapEntry, UpdateContext,
    UpdateEvents, UpdateItemSource, run_update,
};
use sevenzip2_sys as sys;

// ---------------------------------------------------------------------------
// Scripted engine: walks the update protocol exactly like the native module,
// writing a readable trace of what it saw into the output stream
// ---------------------------------------------------------------------------

#[repr(C)]
struct FakeOutArchive {
    iface: sys::IOutArchive,
}

unsafe extern "C" fn fake_out_archive_release(this: *mut c_void) -> u32 {
    unsafe { drop(Box::from_raw(this as *mut FakeOutArchive)) };
    0
}

unsafe extern "C" fn fake_object_release(this: *mut c_void) -> u32 {
    unsafe { drop(Box::from_raw(this as *mut sys::EngineObject)) };
    0
}

static PLAIN_OBJECT_VTBL: sys::EngineObjectVtbl = sys::EngineObjectVtbl {
    release: fake_object_release,
};

unsafe fn write_out(out: *mut sys::ISequentialOutStream, bytes: &[u8]) -> sys::HRESULT {
    let mut processed = 0u32;
    unsafe {
        ((*(*out).vtbl).write)(
            out,
            bytes.as_ptr() as *const c_void,
            bytes.len() as u32,
            &mut processed,
        )
    }
}

unsafe fn take_bstr(value: &sys::PropVariant) -> String {
    if value.vt != sys::VT_BSTR {
        return String::new();
    }
    unsafe {
        let ptr = value.value.str_val;
        if ptr.is_null() {
            return String::new();
        }
        let text = std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned();
        libc::free(ptr as *mut c_void);
        text
    }
}

unsafe extern "C" fn fake_update_items(
    _this: *mut c_void,
    out_stream: *mut sys::ISequentialOutStream,
    num_items: u32,
    callback: *mut sys::IArchiveUpdateCallback,
) -> sys::HRESULT {
    unsafe {
        let vtbl = &*(*callback).vtbl;
        (vtbl.set_total)(callback, 0);

        let mut is_defined = 0i32;
        let mut password: *mut std::os::raw::c_char = std::ptr::null_mut();
        (vtbl.crypto_get_text_password2)(callback, &mut is_defined, &mut password);
        if is_defined != 0 {
            let pw = std::ffi::CStr::from_ptr(password).to_string_lossy().into_owned();
            let _ = write_out(out_stream, format!("PW:{};", pw).as_bytes());
        }
        if !password.is_null() {
            libc::free(password as *mut c_void);
        }

        for index in 0..num_items {
            let mut new_data = 0i32;
            let mut new_properties = 0i32;
            let mut index_in_archive = 0u32;
            let code = (vtbl.get_update_item_info)(
                callback,
                index,
                &mut new_data,
                &mut new_properties,
                &mut index_in_archive,
            );
            if code != sys::S_OK {
                return code;
            }

            if new_data == 0 && new_properties == 0 {
                let _ = write_out(out_stream, format!("COPY:{};", index_in_archive).as_bytes());
                continue;
            }

            let mut value = sys::PropVariant::empty();
            (vtbl.get_property)(callback, index, sys::KPID_PATH, &mut value);
            let name = take_bstr(&value);
            let _ = write_out(out_stream, format!("ITEM:{};", name).as_bytes());

            if new_data == 0 {
                // renamed existing item keeps its stored bytes
                continue;
            }

            let mut stream: *mut sys::ISequentialInStream = std::ptr::null_mut();
            let code = (vtbl.get_stream)(callback, index, &mut stream);
            if code != sys::S_OK {
                return code;
            }
            if !stream.is_null() {
                let mut buf = [0u8; 64];
                loop {
                    let mut processed = 0u32;
                    let code = ((*(*stream).vtbl).read)(
                        stream,
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len() as u32,
                        &mut processed,
                    );
                    if code != sys::S_OK {
                        return code;
                    }
                    if processed == 0 {
                        break;
                    }
                    let _ = write_out(out_stream, &buf[..processed as usize]);
                }
                ((*(*stream).vtbl).release)(stream);
                let _ = write_out(out_stream, b";");
            }
            (vtbl.set_operation_result)(callback, sys::OP_RESULT_OK);
        }
        sys::S_OK
    }
}

static FAKE_OUT_ARCHIVE_VTBL: sys::IOutArchiveVtbl = sys::IOutArchiveVtbl {
    release: fake_out_archive_release,
    update_items: fake_update_items,
};

/// Accepts the writer classes in `out_formats` and the reader classes in
/// `in_formats`; refuses everything else like a trimmed engine build would
struct FakeEngine {
    out_formats: Vec<sys::GUID>,
    in_formats: Vec<sys::GUID>,
}

impl EngineModule for FakeEngine {
    fn create_object(
        &self,
        class_id: &sys::GUID,
        interface_id: &sys::GUID,
    ) -> Result<NonNull<c_void>> {
        if *interface_id == sys::IID_IOUT_ARCHIVE && self.out_formats.contains(class_id) {
            let object = Box::into_raw(Box::new(FakeOutArchive {
                iface: sys::IOutArchive {
                    vtbl: &FAKE_OUT_ARCHIVE_VTBL,
                },
            }));
            return Ok(NonNull::new(object as *mut c_void).unwrap());
        }
        if *interface_id == sys::IID_IIN_ARCHIVE && self.in_formats.contains(class_id) {
            let object = Box::into_raw(Box::new(sys::EngineObject {
                vtbl: &PLAIN_OBJECT_VTBL,
            }));
            return Ok(NonNull::new(object as *mut c_void).unwrap());
        }
        Err(Error::Native { code: sys::E_FAIL })
    }
}

struct FakeEngineLoader;

impl EngineLoader for FakeEngineLoader {
    fn load(&self, _path: &Path) -> Result<Box<dyn EngineModule>> {
        Ok(Box::new(FakeEngine {
            out_formats: vec![
                OutArchiveFormat::SevenZip.class_id(),
                OutArchiveFormat::Zip.class_id(),
            ],
            in_formats: vec![
                InArchiveFormat::SevenZip.class_id(),
                InArchiveFormat::Zip.class_id(),
            ],
        }))
    }
}

fn scripted_manager() -> LibraryManager {
    LibraryManager::with_loader("/fake/7z.so", Box::new(FakeEngineLoader))
}

fn seven_zip_writer(manager: &LibraryManager) -> sevenzip2::NativeInterfaceHandle {
    manager
        .interface_for(CallerId::next(), OutArchiveFormat::SevenZip)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_create_archive_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let alpha = dir.path().join("alpha.txt");
    let beta = dir.path().join("beta.txt");
    std::fs::write(&alpha, b"alpha bytes").unwrap();
    std::fs::write(&beta, b"beta!").unwrap();

    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let source = UpdateItemSource::files(vec![alpha, beta]);
    let callback = ArchiveUpdateCallback::new(source, UpdateContext::create())
        .preserve_directory_structure(false)
        .output_format(OutArchiveFormat::SevenZip);

    let output = run_update(&archive, Vec::new(), callback).unwrap();
    let trace = String::from_utf8(output).unwrap();
    assert!(trace.contains("alpha.txt;alpha bytes;"), "trace: {}", trace);
    assert!(trace.contains("beta.txt;beta!;"), "trace: {}", trace);
}

#[test]
fn test_create_archive_from_stream_map() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let entries = vec![
        StreamMapEntry::new(
            "docs/a.md",
            Some(Box::new(std::io::Cursor::new(b"# a".to_vec()))),
        ),
        StreamMapEntry::new("docs/sub", None),
        StreamMapEntry::new(
            "docs/b.md",
            Some(Box::new(std::io::Cursor::new(b"# b".to_vec()))),
        ),
    ];
    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream_map(entries),
        UpdateContext::create(),
    )
    .output_format(OutArchiveFormat::SevenZip);

    let output = run_update(&archive, Vec::new(), callback).unwrap();
    let trace = String::from_utf8(output).unwrap();
    assert!(trace.contains("ITEM:docs/a.md;# a;"), "trace: {}", trace);
    // the directory entry contributes properties but no data
    assert!(trace.contains("ITEM:docs/sub;"), "trace: {}", trace);
    assert!(trace.contains("ITEM:docs/b.md;# b;"), "trace: {}", trace);
}

#[test]
fn test_append_presents_existing_items_untouched() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let entries = vec![StreamMapEntry::new(
        "added.txt",
        Some(Box::new(std::io::Cursor::new(b"fresh".to_vec()))),
    )];
    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream_map(entries),
        UpdateContext::append(2),
    )
    .output_format(OutArchiveFormat::SevenZip);

    let output = run_update(&archive, Vec::new(), callback).unwrap();
    let trace = String::from_utf8(output).unwrap();
    assert_eq!(trace, "COPY:0;COPY:1;ITEM:added.txt;fresh;");
}

#[test]
fn test_modify_renumbers_and_renames() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let existing = (0..4)
        .map(|i| sevenzip2::ExistingItem {
            name: format!("old{}.txt", i),
            size: 1,
            attributes: 0x80,
            is_directory: false,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
        })
        .collect();
    let mut renames = std::collections::HashMap::new();
    renames.insert(3, None);
    renames.insert(1, Some("final.txt".to_string()));

    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::Existing,
        UpdateContext::modify(existing, renames),
    )
    .output_format(OutArchiveFormat::SevenZip);

    // 4 existing minus 1 deletion leaves 3 presented items
    assert_eq!(callback.presented_item_count(), 3);
    let output = run_update(&archive, Vec::new(), callback).unwrap();
    let trace = String::from_utf8(output).unwrap();
    assert_eq!(trace, "COPY:0;ITEM:final.txt;COPY:2;");
}

#[test]
fn test_password_is_handed_to_the_engine() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream(Box::new(std::io::Cursor::new(b"secret data".to_vec()))),
        UpdateContext::create(),
    )
    .default_item_name("vault.bin")
    .password("hunter2")
    .output_format(OutArchiveFormat::SevenZip);

    let output = run_update(&archive, Vec::new(), callback).unwrap();
    let trace = String::from_utf8(output).unwrap();
    assert!(trace.starts_with("PW:hunter2;"), "trace: {}", trace);
    assert!(trace.contains("ITEM:vault.bin;secret data;"), "trace: {}", trace);
}

struct Recorder {
    names: Arc<Mutex<Vec<String>>>,
    percents: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicUsize>,
    cancel_at: Option<usize>,
}

impl UpdateEvents for Recorder {
    fn item_starting(&mut self, name: &str, _percent: u8) -> bool {
        let mut names = self.names.lock().unwrap();
        names.push(name.to_string());
        match self.cancel_at {
            Some(limit) => names.len() != limit,
            None => true,
        }
    }

    fn progress(&mut self, percent: u8, _delta: u8) {
        self.percents.lock().unwrap().push(percent);
    }

    fn item_finished(&mut self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_events_and_progress_over_full_run() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let entries = (0..4)
        .map(|i| {
            StreamMapEntry::new(
                format!("f{}.bin", i),
                Some(Box::new(std::io::Cursor::new(vec![i as u8; 256]))),
            )
        })
        .collect();
    let names = Arc::new(Mutex::new(Vec::new()));
    let percents = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));
    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream_map(entries),
        UpdateContext::create(),
    )
    .output_format(OutArchiveFormat::SevenZip)
    .events(Box::new(Recorder {
        names: Arc::clone(&names),
        percents: Arc::clone(&percents),
        finished: Arc::clone(&finished),
        cancel_at: None,
    }));

    run_update(&archive, Vec::new(), callback).unwrap();

    assert_eq!(
        *names.lock().unwrap(),
        vec!["f0.bin", "f1.bin", "f2.bin", "f3.bin"]
    );
    assert_eq!(finished.load(Ordering::SeqCst), 4);
    let percents = percents.lock().unwrap();
    assert_eq!(*percents.last().unwrap(), 100);
    for pair in percents.windows(2) {
        assert!(pair[1] > pair[0], "percent sequence regressed: {:?}", *percents);
    }
}

#[test]
fn test_cancellation_stops_the_run() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let entries = (0..10)
        .map(|i| {
            StreamMapEntry::new(
                format!("f{}.bin", i),
                Some(Box::new(std::io::Cursor::new(vec![0u8; 8]))),
            )
        })
        .collect();
    let names = Arc::new(Mutex::new(Vec::new()));
    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream_map(entries),
        UpdateContext::create(),
    )
    .output_format(OutArchiveFormat::SevenZip)
    .events(Box::new(Recorder {
        names: Arc::clone(&names),
        percents: Arc::new(Mutex::new(Vec::new())),
        finished: Arc::new(AtomicUsize::new(0)),
        cancel_at: Some(3),
    }));

    let result = run_update(&archive, Vec::new(), callback);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(names.lock().unwrap().len(), 3, "no items started past the veto");
}

#[test]
fn test_unreadable_file_fails_the_operation() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.txt");
    std::fs::write(&present, b"here").unwrap();

    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let source =
        UpdateItemSource::files(vec![present, dir.path().join("missing.txt")]);
    let callback = ArchiveUpdateCallback::new(source, UpdateContext::create())
        .preserve_directory_structure(false)
        .output_format(OutArchiveFormat::SevenZip);

    let result = run_update(&archive, Vec::new(), callback);
    assert!(matches!(result, Err(Error::ItemResolution { .. })));
}

#[test]
fn test_features_reflect_the_engine_build() {
    let manager = scripted_manager();
    let features = manager.features().unwrap();

    assert!(features.contains(FeatureSet::COMPRESS_7Z));
    assert!(features.contains(FeatureSet::COMPRESS_ZIP));
    assert!(!features.contains(FeatureSet::COMPRESS_TAR));
    assert!(features.contains(FeatureSet::EXTRACT_7Z));
    assert!(features.contains(FeatureSet::EXTRACT_ZIP));
    assert!(!features.contains(FeatureSet::EXTRACT_RAR));
    // 7z write support implies in-place modification
    assert!(features.contains(FeatureSet::MODIFY));
    assert!(!manager.loaded(), "probe-only load is released afterwards");
}

#[test]
fn test_unsupported_writer_is_rejected() {
    let manager = scripted_manager();
    let result = manager.interface_for(CallerId::next(), OutArchiveFormat::Tar);
    assert!(matches!(result, Err(Error::UnsupportedFormat { .. })));
}

#[test]
fn test_output_writer_is_returned() {
    let manager = scripted_manager();
    let archive = seven_zip_writer(&manager);

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.7z");
    let file = std::fs::File::create(&target).unwrap();

    let callback = ArchiveUpdateCallback::new(
        UpdateItemSource::stream(Box::new(std::io::Cursor::new(b"payload".to_vec()))),
        UpdateContext::create(),
    )
    .default_item_name("p.bin")
    .output_format(OutArchiveFormat::SevenZip);

    let mut file = run_update(&archive, file, callback).unwrap();
    file.flush().unwrap();
    drop(file);
    let written = std::fs::read_to_string(&target).unwrap();
    assert_eq!(written, "ITEM:p.bin;payload;");
}
