//! Stage execution engine
//!
//! A stage is a named set of external commands, executed one at a time in
//! lexicographic order of command name. Command output (stdout and stderr
//! combined) is streamed to the console and the install log as it is
//! produced, and kept for diagnostics if the command fails. A command that
//! cannot be started or exits non-zero aborts the stage.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::{debug, warn};
use serde_yaml::Value;

use crate::error::{InstallError, Result};
use crate::reporter::{ReportLevel, ReportScope};

/// Environment variable carrying the command's reporting scope.
pub const REPORT_SCOPE_VAR: &str = "GROUNDWORK_REPORT_SCOPE";

/// How a configured command is invoked, resolved once at stage
/// construction time: a string runs through the shell, a sequence is
/// executed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Resolve a configured command value. Falsy values (null, false,
    /// empty string, empty list) mean "skip" and resolve to `None`.
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null | Value::Bool(false) => Ok(None),
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) => Ok(Some(Self::Shell(s.clone()))),
            Value::Sequence(seq) if seq.is_empty() => Ok(None),
            Value::Sequence(seq) => {
                let argv = seq
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            InstallError::config(format!(
                                "command argument is not a string: {v:?}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<String>>>()?;
                Ok(Some(Self::Argv(argv)))
            }
            other => Err(InstallError::config(format!(
                "invalid command value: {other:?}"
            ))),
        }
    }

    /// The literal invocation, for reporting descriptions and errors.
    pub fn display(&self) -> String {
        match self {
            Self::Shell(s) => s.clone(),
            Self::Argv(argv) => argv.join(" "),
        }
    }

    fn command(&self) -> Command {
        match self {
            Self::Shell(s) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(s);
                cmd
            }
            Self::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
        }
    }
}

/// Forwards command output to the console, the install log, and a capture
/// buffer. Log writes are best-effort: a failing log never fails a stage.
struct OutputSink {
    log: Option<File>,
    captured: Vec<u8>,
}

impl OutputSink {
    fn write(&mut self, data: &[u8]) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
        if let Some(log) = self.log.as_mut() {
            if log.write_all(data).is_err() {
                self.log = None;
            }
        }
        self.captured.extend_from_slice(data);
    }
}

fn pump(mut reader: impl Read, sink: &Arc<Mutex<OutputSink>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().expect("output sink poisoned").write(&buf[..n]),
        }
    }
}

/// One named installation stage: its commands, the environment snapshot
/// they all receive, and the reporting scope they nest under.
pub struct Stage {
    name: String,
    commands: Vec<(String, CommandSpec)>,
    env: HashMap<String, String>,
    scope: ReportScope,
    log_file: Option<PathBuf>,
}

impl Stage {
    pub fn new(
        name: &str,
        commands: &BTreeMap<String, Value>,
        env: HashMap<String, String>,
        scope: ReportScope,
        log_file: Option<&Path>,
    ) -> Result<Self> {
        let mut resolved = Vec::new();
        // BTreeMap iteration gives the lexicographic command order.
        for (cmdname, value) in commands {
            if let Some(spec) = CommandSpec::from_value(value)? {
                resolved.push((cmdname.clone(), spec));
            }
        }
        Ok(Self {
            name: name.to_string(),
            commands: resolved,
            env,
            scope,
            log_file: log_file.map(Path::to_path_buf),
        })
    }

    /// Open the install log for appending. Best-effort: on failure the
    /// stage runs without one.
    fn open_install_log(&self) -> Option<File> {
        let path = self.log_file.as_ref()?;
        OpenOptions::new().create(true).append(true).open(path).ok()
    }

    /// Run every command of this stage in order, aborting on the first
    /// failure.
    pub fn run(&self) -> Result<()> {
        let start = Instant::now();
        for (cmdname, spec) in &self.commands {
            self.run_command(cmdname, spec)?;
        }
        debug!("stage_{} took {:.3}s", self.name, start.elapsed().as_secs_f64());
        Ok(())
    }

    fn run_command(&self, cmdname: &str, spec: &CommandSpec) -> Result<()> {
        let scope = self.scope.child(
            cmdname,
            &format!("running '{}'", spec.display()),
            ReportLevel::Debug,
        );
        let start = Instant::now();
        let result = scope.run(|| {
            let mut cmd = spec.command();
            cmd.env_clear()
                .envs(&self.env)
                .env(REPORT_SCOPE_VAR, scope.fullname())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.spawn().map_err(|e| {
                warn!("{cmdname} command failed to start");
                InstallError::ProcessLaunch {
                    command: spec.display(),
                    source: e,
                }
            })?;

            let sink = Arc::new(Mutex::new(OutputSink {
                log: self.open_install_log(),
                captured: Vec::new(),
            }));

            // stdout is drained on this thread, stderr on a helper, both
            // through the shared sink so output reaches the console and
            // log as it is produced.
            let stderr = child.stderr.take().expect("stderr was piped");
            let stderr_sink = Arc::clone(&sink);
            let drain = thread::spawn(move || pump(stderr, &stderr_sink));
            if let Some(stdout) = child.stdout.take() {
                pump(stdout, &sink);
            }
            let _ = drain.join();

            let status = child.wait()?;
            if !status.success() {
                warn!("{cmdname} command failed");
                let captured = {
                    let guard = sink.lock().expect("output sink poisoned");
                    String::from_utf8_lossy(&guard.captured).into_owned()
                };
                return Err(InstallError::ProcessExecution {
                    command: spec.display(),
                    exit_code: status.code().unwrap_or(-1),
                    output: captured,
                });
            }
            Ok(())
        });
        debug!("{} took {:.3}s", cmdname, start.elapsed().as_secs_f64());
        result
    }
}
