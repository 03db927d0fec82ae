//! File-based settings for the problem details middleware.
//!
//! Settings are loaded once at startup from a TOML table and validated before
//! the middleware is built. Invalid settings are rejected with a clear error
//! rather than silently falling back to defaults. Callbacks (mappers, the
//! is-problem predicate, the before-write hook) cannot be expressed in TOML;
//! set those on [`ProblemDetailsOptions`](crate::ProblemDetailsOptions) after
//! calling [`from_settings`](crate::ProblemDetailsOptions::from_settings).
//!
//! # Example
//! ```toml
//! [problem_details]
//! include_exception_details = true
//! source_code_line_count    = 4
//! content_root              = "/srv/app"
//! allowed_header_names      = ["access-control-allow-origin", "x-request-id"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use http::HeaderName;
use serde::{Deserialize, Serialize};

/// Settings for [`ProblemDetailsLayer`](crate::ProblemDetailsLayer).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProblemDetailsSettings {
    /// Include error messages and source snippets in problem payloads
    /// (default: false). Only enable this outside production.
    #[serde(default)]
    pub include_exception_details: bool,

    /// Lines of source shown before and after a failing line (default: 6).
    #[serde(default = "defaults::source_code_line_count")]
    pub source_code_line_count: usize,

    /// Response headers kept when a response is reset to a problem.
    ///
    /// Defaults to the CORS response headers plus `strict-transport-security`,
    /// which earlier layers set and which would otherwise be lost.
    #[serde(default = "defaults::allowed_header_names")]
    pub allowed_header_names: Vec<String>,

    /// Directory that relative source paths are resolved against (default: `.`).
    #[serde(default = "defaults::content_root")]
    pub content_root: PathBuf,
}

impl Default for ProblemDetailsSettings {
    fn default() -> Self {
        Self {
            include_exception_details: false,
            source_code_line_count: defaults::source_code_line_count(),
            allowed_header_names: defaults::allowed_header_names(),
            content_root: defaults::content_root(),
        }
    }
}

impl ProblemDetailsSettings {
    /// Read settings from a TOML file containing a `[problem_details]` table.
    ///
    /// A missing table yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            problem_details: ProblemDetailsSettings,
        }

        let file: File = toml::from_str(content).context("parsing problem details TOML")?;
        file.problem_details.validate()?;
        Ok(file.problem_details)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Every allowed header must be a valid header name
        for name in &self.allowed_header_names {
            anyhow::ensure!(
                HeaderName::from_bytes(name.as_bytes()).is_ok(),
                "allowed_header_names entry `{}` is not a valid header name",
                name
            );
        }

        // Snippets need at least one line of context to be worth reading files for
        anyhow::ensure!(
            !self.include_exception_details || self.source_code_line_count > 0,
            "source_code_line_count must be positive when include_exception_details is set"
        );

        Ok(())
    }

    /// Parsed allow-list. Invalid names are skipped; [`validate`](Self::validate)
    /// reports them.
    pub fn header_names(&self) -> Vec<HeaderName> {
        self.allowed_header_names
            .iter()
            .filter_map(|n| HeaderName::from_bytes(n.as_bytes()).ok())
            .collect()
    }
}

pub(crate) mod defaults {
    use std::path::PathBuf;

    use http::header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
        ACCESS_CONTROL_MAX_AGE, STRICT_TRANSPORT_SECURITY,
    };

    use crate::details::DEFAULT_SOURCE_CODE_LINE_COUNT;

    pub fn source_code_line_count() -> usize { DEFAULT_SOURCE_CODE_LINE_COUNT }
    pub fn content_root() -> PathBuf { PathBuf::from(".") }

    pub fn allowed_header_names() -> Vec<String> {
        [
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_EXPOSE_HEADERS,
            ACCESS_CONTROL_MAX_AGE,
            STRICT_TRANSPORT_SECURITY,
        ]
        .iter()
        .map(|h| h.as_str().to_owned())
        .collect()
    }
}
