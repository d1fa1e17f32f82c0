#![no_main]

use gbp_core::PublisherError;
use gbp_worker::{Error, is_retryable};
use libfuzzer_sys::fuzz_target;

// Invariant from spec.md §4.9: every `Error` is retryable except a CI 404
// (the build is already gone) and non-CI errors (queue/thread/invalid-build
// failures are never worth retrying).
fuzz_target!(|data: (bool, bool, String)| {
    let (is_ci, is_not_found, text) = data;

    let err = if is_ci {
        let ci_err = if is_not_found {
            gbp_ci::Error::NotFound
        } else {
            gbp_ci::Error::Transport(text)
        };
        Error::Publisher(PublisherError::Ci(ci_err))
    } else {
        Error::Queue(text)
    };

    let retryable = is_retryable(&err);
    assert_eq!(retryable, is_ci && !is_not_found);
});
