//! Source-level enrichment for unhandled errors.
//!
//! Rust errors do not carry stack traces by themselves. [`TracedError`]
//! attaches one: either captured from [`std::backtrace::Backtrace`] (which
//! honours `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`) or supplied explicitly.
//! [`ExceptionDetailsProvider`] walks an error's `source()` chain, resolves
//! every traced frame to a window of source lines through a [`FileProvider`],
//! and produces the `errors` extension of a developer problem payload.
//!
//! Frames that cannot be resolved (no location, file missing or not UTF-8,
//! line past the end of the file) are skipped. Any other read failure fails the whole
//! enrichment so the middleware can fall back to the generic payload.

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tower::BoxError;

/// Default number of context lines shown before and after the failing line.
pub const DEFAULT_SOURCE_CODE_LINE_COUNT: usize = 6;

/// One raw frame of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            function: Some(function.into()),
            file: Some(file.into()),
            line: Some(line),
        }
    }
}

/// Parse the `Display` rendering of a [`Backtrace`] into frames.
///
/// The format is one `N: symbol` line per frame, optionally followed by an
/// indented `at path:line:column` line.
pub fn parse_backtrace(rendered: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();

    for line in rendered.lines().map(str::trim) {
        if let Some(location) = line.strip_prefix("at ") {
            let Some(frame) = frames.last_mut() else {
                continue;
            };
            let mut parts = location.rsplitn(3, ':');
            let _column = parts.next();
            let line_no = parts.next().and_then(|l| l.parse::<u32>().ok());
            let path = parts.next();
            if let (Some(path), Some(line_no)) = (path, line_no) {
                frame.file = Some(PathBuf::from(path));
                frame.line = Some(line_no);
            }
            continue;
        }

        let Some((index, symbol)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        frames.push(StackFrame {
            function: Some(symbol.to_owned()),
            file: None,
            line: None,
        });
    }

    frames
}

/// An error with an attached stack trace.
///
/// `Display` and `source()` are forwarded to the wrapped error, so wrapping
/// does not add an extra link to the error chain.
pub struct TracedError {
    inner: BoxError,
    frames: Vec<StackFrame>,
}

impl TracedError {
    /// Wrap `error`, capturing the current backtrace if capture is enabled.
    ///
    /// An error that is already traced keeps its original frames.
    pub fn capture<E: Into<BoxError>>(error: E) -> Self {
        let inner: BoxError = error.into();
        let inner = match inner.downcast::<Self>() {
            Ok(traced) => return *traced,
            Err(inner) => inner,
        };

        let backtrace = Backtrace::capture();
        let frames = match backtrace.status() {
            BacktraceStatus::Captured => parse_backtrace(&backtrace.to_string()),
            _ => Vec::new(),
        };
        Self { inner, frames }
    }

    /// Wrap `error` with explicit frames.
    pub fn with_frames<E: Into<BoxError>>(error: E, frames: Vec<StackFrame>) -> Self {
        Self {
            inner: error.into(),
            frames,
        }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// The wrapped error.
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Debug for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error for TracedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

/// Look through a [`TracedError`] wrapper to the error it carries.
pub fn peel<'a>(error: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    match error.downcast_ref::<TracedError>() {
        Some(traced) => traced.inner(),
        None => error,
    }
}

/// Read access to source files.
pub trait FileProvider: Send + Sync {
    /// Return the file's contents, `Ok(None)` if it does not exist.
    fn read_source(&self, path: &Path) -> io::Result<Option<String>>;
}

/// Reads files from disk, resolving relative paths against a content root.
#[derive(Debug, Clone)]
pub struct PhysicalFileProvider {
    root: PathBuf,
}

impl PhysicalFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileProvider for PhysicalFileProvider {
    fn read_source(&self, path: &Path) -> io::Result<Option<String>> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        match std::fs::read_to_string(&full) {
            Ok(content) => Ok(Some(content)),
            // Non-UTF-8 files have no readable source lines.
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::InvalidData) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// A resolved frame: its location and the surrounding source lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnippet {
    pub file_path: String,
    pub file_name: String,
    pub function: Option<String>,
    pub line_number: u32,
    /// Line number of the first entry in `pre_context_code`.
    pub pre_context_line: u32,
    pub pre_context_code: Vec<String>,
    pub context_code: String,
    pub post_context_code: Vec<String>,
}

/// Developer-facing description of one error in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub message: String,
    /// `Debug` rendering of the error.
    pub raw: String,
    pub stack_frames: Vec<SourceSnippet>,
}

#[derive(Debug, thiserror::Error)]
pub enum DetailsError {
    #[error("failed to read source file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolves stack frames of an error to source snippets.
#[derive(Clone)]
pub struct ExceptionDetailsProvider {
    files: Arc<dyn FileProvider>,
    source_code_line_count: usize,
}

impl fmt::Debug for ExceptionDetailsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionDetailsProvider")
            .field("source_code_line_count", &self.source_code_line_count)
            .finish_non_exhaustive()
    }
}

impl ExceptionDetailsProvider {
    pub fn new(files: Arc<dyn FileProvider>, source_code_line_count: usize) -> Self {
        Self {
            files,
            source_code_line_count,
        }
    }

    /// One entry per error in `error`'s source chain, outermost first.
    pub fn get_details(
        &self,
        error: &(dyn Error + 'static),
    ) -> Result<Vec<ExceptionDetails>, DetailsError> {
        std::iter::successors(Some(error), |e| (*e).source())
            .map(|e| {
                let mut stack_frames = Vec::new();
                for frame in frames_of(e) {
                    if let Some(snippet) = self.resolve_frame(frame)? {
                        stack_frames.push(snippet);
                    }
                }
                Ok(ExceptionDetails {
                    message: e.to_string(),
                    raw: format!("{e:?}"),
                    stack_frames,
                })
            })
            .collect()
    }

    /// Resolve a single frame, `Ok(None)` when its source is unavailable.
    pub fn resolve_frame(&self, frame: &StackFrame) -> Result<Option<SourceSnippet>, DetailsError> {
        let (Some(path), Some(line_number)) = (frame.file.as_deref(), frame.line) else {
            return Ok(None);
        };

        let content = self
            .files
            .read_source(path)
            .map_err(|source| DetailsError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let Some(content) = content else {
            return Ok(None);
        };

        let lines: Vec<&str> = content.lines().collect();
        let index = line_number as usize;
        if index == 0 || index > lines.len() {
            return Ok(None);
        }

        let count = self.source_code_line_count;
        let pre_start = index.saturating_sub(count).max(1);
        let post_end = index.saturating_add(count).min(lines.len());

        Ok(Some(SourceSnippet {
            file_path: path.display().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            function: frame.function.clone(),
            line_number,
            pre_context_line: u32::try_from(pre_start).unwrap_or(line_number),
            pre_context_code: lines[pre_start - 1..index - 1]
                .iter()
                .map(|l| (*l).to_owned())
                .collect(),
            context_code: lines[index - 1].to_owned(),
            post_context_code: lines[index..post_end]
                .iter()
                .map(|l| (*l).to_owned())
                .collect(),
        }))
    }
}

fn frames_of<'a>(error: &'a (dyn Error + 'static)) -> &'a [StackFrame] {
    error
        .downcast_ref::<TracedError>()
        .map(TracedError::frames)
        .unwrap_or_default()
}
