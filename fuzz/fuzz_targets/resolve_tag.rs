#![no_main]

use gbp_storage::Storage;
use gbp_types::validate_tag_name;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

// `resolve_tag` takes a fully attacker-controlled "<machine>@<tag>" string
// straight from a URL path segment in the real deployment. It must never
// panic and must never resolve outside the storage root, regardless of
// `..`, NUL bytes, or other path-breaking content in `data`.
fuzz_target!(|data: &str| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };
    let storage = Storage::new(td.path());
    if storage.init().is_err() {
        return;
    }

    let _ = storage.resolve_tag(data);

    if let Some((_, tag)) = data.split_once('@') {
        let _ = validate_tag_name(tag);
    }
});
