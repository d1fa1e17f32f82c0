#![no_main]

use gbp_core::apikey::{decrypt, encrypt};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let root_key = "fuzz-root-key";

    if let Ok(ciphertext) = encrypt(data, root_key) {
        if let Ok(decrypted) = decrypt(&ciphertext, root_key) {
            assert_eq!(data.to_vec(), decrypted);
        }
    }
});
