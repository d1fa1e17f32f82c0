#![no_main]

use std::io::Cursor;
use std::sync::Arc;

use gbp_ci::FakeCiClient;
use gbp_records::MemoryRecordDb;
use gbp_storage::Storage;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

// Arbitrary bytes fed as an outer archive tar. `restore` must reject
// truncated or malformed input with an `Error`, never panic, and never
// write outside the storage root it's handed.
fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let storage = Storage::new(td.path());
    if storage.init().is_err() {
        return;
    }

    let ci = Arc::new(FakeCiClient::new());
    let records = Arc::new(MemoryRecordDb::new());
    let publisher = gbp_core::Publisher::new(ci, storage, records, "fuzz-host", "0.0.0-fuzz");

    let _ = gbp_archive::restore(&publisher, Cursor::new(data), |_, _, _| {});
});
