#![no_main]

use gbp_types::{BuildRecord, GBPMetadata, Package};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(record) = serde_json::from_str::<BuildRecord>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&record) {
            if let Ok(parsed) = serde_json::from_str::<BuildRecord>(&roundtripped) {
                assert_eq!(record.build, parsed.build);
                assert_eq!(record.keep, parsed.keep);
                assert_eq!(record.note, parsed.note);
            }
        }
    }

    if let Ok(pkg) = serde_json::from_str::<Package>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&pkg) {
            if let Ok(parsed) = serde_json::from_str::<Package>(&roundtripped) {
                assert_eq!(pkg, parsed);
            }
        }
    }

    if let Ok(meta) = serde_json::from_str::<GBPMetadata>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&meta) {
            if let Ok(parsed) = serde_json::from_str::<GBPMetadata>(&roundtripped) {
                assert_eq!(meta, parsed);
            }
        }
    }
});
