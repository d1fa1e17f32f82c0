//! A minimal Jenkins-shaped [`CiClient`], grounded on the original
//! `JenkinsConfig`/`URLBuilder` pair. Job-creation XML payloads are not
//! implemented (out of scope).

use std::collections::HashMap;
use std::io::Read;

use gbp_types::Build;

use crate::{BuildMetadata, CiClient, Error};

/// Connection details for a Jenkins server.
#[derive(Debug, Clone)]
pub struct JenkinsConfig {
    pub base_url: String,
    pub user: Option<String>,
    pub api_key: Option<String>,
    pub artifact_name: String,
}

/// A [`CiClient`] backed by a real Jenkins server over HTTP.
pub struct JenkinsClient {
    config: JenkinsConfig,
    http: reqwest::blocking::Client,
}

impl JenkinsClient {
    pub fn new(config: JenkinsConfig) -> Self {
        Self {
            config,
            http: reqwest::blocking::Client::new(),
        }
    }

    fn job_url(&self, build: &Build, suffix: &str) -> String {
        format!(
            "{}/job/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            build.machine,
            build.build_id,
            suffix
        )
    }

    fn authed(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match (&self.config.user, &self.config.api_key) {
            (Some(user), Some(key)) => builder.basic_auth(user, Some(key)),
            _ => builder,
        }
    }

    fn map_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, Error> {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        resp.error_for_status()
            .map_err(|e| Error::HttpStatus(e.to_string()))
    }
}

impl CiClient for JenkinsClient {
    fn download_artifact(&self, build: &Build) -> Result<Box<dyn Read + Send>, Error> {
        let url = self.job_url(build, &format!("artifact/{}", self.config.artifact_name));
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        Ok(Box::new(resp))
    }

    fn get_logs(&self, build: &Build) -> Result<String, Error> {
        let url = self.job_url(build, "consoleText");
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        resp.text().map_err(|e| Error::Transport(e.to_string()))
    }

    fn get_metadata(&self, build: &Build) -> Result<BuildMetadata, Error> {
        let url = self.job_url(build, "api/json");
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        let json: serde_json::Value = resp.json().map_err(|e| Error::Transport(e.to_string()))?;
        let duration_seconds = json["duration"].as_i64().unwrap_or(0) / 1000;
        let timestamp_ms = json["timestamp"].as_i64().unwrap_or(0);
        Ok(BuildMetadata {
            duration_seconds,
            timestamp_ms,
        })
    }

    fn schedule_build(
        &self,
        machine: &str,
        params: &HashMap<String, String>,
    ) -> Result<Option<String>, Error> {
        let url = format!(
            "{}/job/{}/buildWithParameters",
            self.config.base_url.trim_end_matches('/'),
            machine
        );
        let resp = self
            .authed(self.http.post(&url).query(params))
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let resp = Self::map_status(resp)?;
        Ok(resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}
