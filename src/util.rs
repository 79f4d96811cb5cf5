//! Small helpers shared across the installer core: install-source
//! sanitation, a capture-output subprocess wrapper, and file utilities.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use log::debug;

use crate::error::{InstallError, Result};

/// Source descriptor types the extractor understands. `dd-*` types are raw
/// disk images; at most one of those may appear in a configuration.
pub const SUPPORTED_SOURCE_TYPES: &[&str] = &[
    "tgz",
    "tbz",
    "txz",
    "squashfs",
    "fsimage",
    "fsimage-layered",
    "dd-tgz",
    "dd-tbz",
    "dd-txz",
    "dd-tar",
    "dd-bz2",
    "dd-gz",
    "dd-xz",
    "dd-raw",
];

const DEFAULT_SOURCE_TYPE: &str = "tgz";

/// A normalized install source: an explicit type plus the location to pull
/// the image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub kind: String,
    pub uri: String,
}

impl SourceSpec {
    /// True if this source is written to disk as a raw image rather than
    /// extracted into a filesystem.
    pub fn is_disk_image(&self) -> bool {
        self.kind.starts_with("dd-")
    }
}

/// Validate and normalize a source descriptor string.
///
/// Accepted forms: `<type>:<uri>` with a recognized type, a plain URL with
/// an `http`/`https`/`file`/`cp` scheme, or a bare filesystem path. The
/// latter two default to the `tgz` type. Anything else is a usage error.
pub fn sanitize_source(source: &str) -> Result<SourceSpec> {
    for kind in SUPPORTED_SOURCE_TYPES {
        if let Some(uri) = source.strip_prefix(&format!("{kind}:")) {
            return Ok(SourceSpec {
                kind: (*kind).to_string(),
                uri: uri.to_string(),
            });
        }
    }

    match source.split_once(':') {
        None => Ok(SourceSpec {
            kind: DEFAULT_SOURCE_TYPE.to_string(),
            uri: source.to_string(),
        }),
        Some((scheme, _)) if matches!(scheme, "http" | "https" | "file" | "cp") => {
            Ok(SourceSpec {
                kind: DEFAULT_SOURCE_TYPE.to_string(),
                uri: source.to_string(),
            })
        }
        Some((kind, _)) => Err(InstallError::usage(format!(
            "invalid source type '{kind}' in source '{source}'"
        ))),
    }
}

/// Run a command to completion and capture its stdout.
///
/// Used for host-side teardown and kexec staging, where commands are short
/// and there is no value in streaming output.
pub fn subp(args: &[&str]) -> Result<String> {
    subp_env(args, &[])
}

/// Like [`subp`], with extra environment variables set on the child.
pub fn subp_env(args: &[&str], env: &[(&str, &str)]) -> Result<String> {
    debug!("running: {}", args.join(" "));
    let (prog, rest) = args
        .split_first()
        .ok_or_else(|| InstallError::config("empty command"))?;
    let mut cmd = Command::new(prog);
    cmd.args(rest);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let output = cmd.output().map_err(|e| InstallError::ProcessLaunch {
        command: args.join(" "),
        source: e,
    })?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(InstallError::ProcessExecution {
            command: args.join(" "),
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Create a directory and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file with an explicit mode, creating parent directories.
pub fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_typed_source() {
        let src = sanitize_source("dd-raw:http://host/image.img").unwrap();
        assert_eq!(src.kind, "dd-raw");
        assert_eq!(src.uri, "http://host/image.img");
        assert!(src.is_disk_image());
    }

    #[test]
    fn test_sanitize_scheme_defaults_to_tgz() {
        let src = sanitize_source("http://host/rootfs.tgz").unwrap();
        assert_eq!(src.kind, "tgz");
        assert_eq!(src.uri, "http://host/rootfs.tgz");
        assert!(!src.is_disk_image());

        let src = sanitize_source("cp:///media/rootfs").unwrap();
        assert_eq!(src.kind, "tgz");
        assert_eq!(src.uri, "cp:///media/rootfs");
    }

    #[test]
    fn test_sanitize_bare_path_defaults_to_tgz() {
        let src = sanitize_source("/srv/images/rootfs.tgz").unwrap();
        assert_eq!(src.kind, "tgz");
        assert_eq!(src.uri, "/srv/images/rootfs.tgz");
    }

    #[test]
    fn test_sanitize_unknown_type_is_usage_error() {
        let err = sanitize_source("nbd:10.0.0.1/export").unwrap_err();
        assert!(matches!(err, InstallError::Usage(_)));
    }

    #[test]
    fn test_subp_captures_stdout() {
        let out = subp(&["echo", "hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_subp_nonzero_exit() {
        let err = subp(&["sh", "-c", "echo oops >&2; exit 3"]).unwrap_err();
        match err {
            InstallError::ProcessExecution {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_subp_env_sets_child_variables() {
        let out = subp_env(
            &["sh", "-c", "echo \"$DEBIAN_FRONTEND\""],
            &[("DEBIAN_FRONTEND", "noninteractive")],
        )
        .unwrap();
        assert_eq!(out.trim(), "noninteractive");
    }

    #[test]
    fn test_subp_missing_binary_is_launch_error() {
        let err = subp(&["/no/such/binary-anywhere"]).unwrap_err();
        assert!(matches!(err, InstallError::ProcessLaunch { .. }));
    }

    #[test]
    fn test_write_file_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/install.log");
        write_file(&path, b"data", 0o400).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }
}
