//! Progress reporting scopes
//!
//! The installer reports progress as a stack of named scopes: one scope for
//! the whole install, one per stage, one per command. Entering a scope
//! emits a start event, leaving it emits a finish event with an outcome.
//! The transport is abstracted behind `EventSink`; the default sink simply
//! logs events. Stage commands learn their own scope through the
//! `GROUNDWORK_REPORT_SCOPE` environment variable so externally-produced
//! events can be correlated with this process's.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};

/// Severity attached to a scope's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Info,
    Debug,
}

/// Outcome carried by a scope's finish event.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Fail(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail(msg) => write!(f, "FAIL: {msg}"),
        }
    }
}

/// Destination for reporting events. Object-safe so the orchestrator can
/// carry any backend without knowing its transport.
pub trait EventSink: Send + Sync {
    fn start(&self, scope: &str, description: &str, level: ReportLevel);
    fn finish(&self, scope: &str, description: &str, level: ReportLevel, outcome: &Outcome);
}

/// Default sink: events go to the log and nowhere else.
pub struct LogSink;

impl EventSink for LogSink {
    fn start(&self, scope: &str, description: &str, level: ReportLevel) {
        match level {
            ReportLevel::Info => info!("start: {scope}: {description}"),
            ReportLevel::Debug => debug!("start: {scope}: {description}"),
        }
    }

    fn finish(&self, scope: &str, description: &str, level: ReportLevel, outcome: &Outcome) {
        match level {
            ReportLevel::Info => info!("finish: {scope}: {outcome}: {description}"),
            ReportLevel::Debug => debug!("finish: {scope}: {outcome}: {description}"),
        }
    }
}

/// One unit of reportable work. Scopes nest: a child's full name is
/// `parent/name`, mirroring the event stack an observer reconstructs.
#[derive(Clone)]
pub struct ReportScope {
    fullname: String,
    description: String,
    level: ReportLevel,
    sink: Arc<dyn EventSink>,
}

impl ReportScope {
    pub fn root(name: &str, description: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            fullname: name.to_string(),
            description: description.to_string(),
            level: ReportLevel::Info,
            sink,
        }
    }

    pub fn child(&self, name: &str, description: &str, level: ReportLevel) -> Self {
        Self {
            fullname: format!("{}/{}", self.fullname, name),
            description: description.to_string(),
            level,
            sink: Arc::clone(&self.sink),
        }
    }

    /// The `/`-joined scope path, exported to stage commands.
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Enter the scope, run `f`, leave with the matching outcome. The
    /// finish event fires whether or not `f` succeeds.
    pub fn run<T, E: fmt::Display>(
        &self,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        self.sink.start(&self.fullname, &self.description, self.level);
        let result = f();
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::Fail(e.to_string()),
        };
        self.sink
            .finish(&self.fullname, &self.description, self.level, &outcome);
        result
    }
}

/// Top-level reporting handle for one install attempt: the install scope
/// plus the list of files an observer should collect afterwards.
pub struct Reporter {
    scope: ReportScope,
    post_files: Vec<PathBuf>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            scope: ReportScope::root("install", "installing system", sink),
            post_files: Vec::new(),
        }
    }

    pub fn scope(&self) -> &ReportScope {
        &self.scope
    }

    /// Record which files the backend should pick up once the install ends.
    pub fn set_post_files(&mut self, files: Vec<PathBuf>) {
        self.post_files = files;
    }

    pub fn post_files(&self) -> &[PathBuf] {
        &self.post_files
    }

    pub fn report_success(&self) {
        self.scope.sink.finish(
            self.scope.fullname(),
            &self.scope.description,
            ReportLevel::Info,
            &Outcome::Success,
        );
    }

    pub fn report_failure(&self, message: &str) {
        self.scope.sink.finish(
            self.scope.fullname(),
            &self.scope.description,
            ReportLevel::Info,
            &Outcome::Fail(message.to_string()),
        );
    }
}
