//! The CI server boundary: download artifacts, fetch logs and build
//! metadata, schedule builds. Job-creation payloads (the original's
//! Jenkins-XML `create_item`/`create_repo_job`/`create_machine_job`) are out
//! of scope and not implemented here.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use gbp_types::Build;

mod jenkins;
pub use jenkins::{JenkinsClient, JenkinsConfig};

/// Errors talking to the CI server. HTTP 404 gets its own variant because
/// the worker's retry policy treats it as terminal rather than transient
/// (§4.9 of the design: 404 means the build is gone, don't retry).
///
/// [`Error::HttpStatus`] (a non-404 HTTP status response) is likewise
/// terminal: it mirrors the original's `PUBLISH_FATAL_EXCEPTIONS =
/// (requests.exceptions.HTTPError,)` (`jobs/common.py`), which only ever
/// swallows a status error. [`Error::Transport`] is reserved for failures
/// that never got a response at all (connection refused, DNS, timeout) and
/// is retryable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build not found on CI server")]
    NotFound,
    #[error("CI server returned an error status: {0}")]
    HttpStatus(String),
    #[error("CI transport error: {0}")]
    Transport(String),
}

/// `(duration_seconds, timestamp_ms)` for a completed build, as reported by
/// the CI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildMetadata {
    pub duration_seconds: i64,
    pub timestamp_ms: i64,
}

/// The external CI server collaborator.
pub trait CiClient: Send + Sync {
    fn download_artifact(&self, build: &Build) -> Result<Box<dyn Read + Send>, Error>;
    fn get_logs(&self, build: &Build) -> Result<String, Error>;
    fn get_metadata(&self, build: &Build) -> Result<BuildMetadata, Error>;
    fn schedule_build(
        &self,
        machine: &str,
        params: &HashMap<String, String>,
    ) -> Result<Option<String>, Error>;
}

/// In-memory test double. Builds not registered via `with_*` resolve as
/// [`Error::NotFound`], matching the "404 terminates the pipeline" scenario.
#[derive(Default)]
pub struct FakeCiClient {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    logs: Mutex<HashMap<String, String>>,
    metadata: Mutex<HashMap<String, BuildMetadata>>,
}

impl FakeCiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(&self, build: &Build, tar_bytes: Vec<u8>) -> &Self {
        self.artifacts
            .lock()
            .unwrap()
            .insert(build.to_string(), tar_bytes);
        self
    }

    pub fn with_logs(&self, build: &Build, logs: impl Into<String>) -> &Self {
        self.logs.lock().unwrap().insert(build.to_string(), logs.into());
        self
    }

    pub fn with_metadata(&self, build: &Build, metadata: BuildMetadata) -> &Self {
        self.metadata.lock().unwrap().insert(build.to_string(), metadata);
        self
    }
}

impl CiClient for FakeCiClient {
    fn download_artifact(&self, build: &Build) -> Result<Box<dyn Read + Send>, Error> {
        let bytes = self
            .artifacts
            .lock()
            .unwrap()
            .get(&build.to_string())
            .cloned()
            .ok_or(Error::NotFound)?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn get_logs(&self, build: &Build) -> Result<String, Error> {
        self.logs
            .lock()
            .unwrap()
            .get(&build.to_string())
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_metadata(&self, build: &Build) -> Result<BuildMetadata, Error> {
        self.metadata
            .lock()
            .unwrap()
            .get(&build.to_string())
            .copied()
            .ok_or(Error::NotFound)
    }

    fn schedule_build(
        &self,
        _machine: &str,
        _params: &HashMap<String, String>,
    ) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_client_reports_not_found_for_unregistered_build() {
        let client = FakeCiClient::new();
        let build = Build::new("x", "9").unwrap();
        assert!(matches!(
            client.download_artifact(&build),
            Err(Error::NotFound)
        ));
        assert!(matches!(client.get_logs(&build), Err(Error::NotFound)));
        assert!(matches!(client.get_metadata(&build), Err(Error::NotFound)));
    }

    #[test]
    fn fake_client_serves_registered_data() {
        let client = FakeCiClient::new();
        let build = Build::new("babette", "1").unwrap();
        client.with_artifact(&build, vec![1, 2, 3]);
        client.with_logs(&build, "log output");
        client.with_metadata(
            &build,
            BuildMetadata {
                duration_seconds: 42,
                timestamp_ms: 1_700_000_000_000,
            },
        );

        let mut bytes = Vec::new();
        client.download_artifact(&build).unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(client.get_logs(&build).unwrap(), "log output");
        assert_eq!(client.get_metadata(&build).unwrap().duration_seconds, 42);
    }
}
