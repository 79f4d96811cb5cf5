//! Diagnostic archive creation
//!
//! On failure the orchestrator packs the install log, the other configured
//! post-install files, and a dump of the effective configuration into a
//! tar archive for offline debugging.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::{info, warn};
use tar::{Builder, Header};

use crate::config::Config;
use crate::error::Result;
use crate::util::ensure_dir;

const CONFIG_ENTRY_NAME: &str = "groundwork-config.yaml";

/// Create a tar archive of everything useful for diagnosing a failed
/// install. Files that do not exist are skipped with a warning.
pub fn create_log_tarfile(tarfile: &Path, cfg: &Config) -> Result<()> {
    info!("creating error archive at {}", tarfile.display());
    if let Some(parent) = tarfile.parent() {
        ensure_dir(parent)?;
    }

    let opts = cfg.install_options();
    let mut files: Vec<PathBuf> = vec![opts.log_file.clone()];
    for f in &opts.post_files {
        if !files.contains(f) {
            files.push(f.clone());
        }
    }

    let mut builder = Builder::new(File::create(tarfile)?);
    for path in &files {
        if !path.is_file() {
            warn!("not archiving {}: file does not exist", path.display());
            continue;
        }
        let name = path.strip_prefix("/").unwrap_or(path);
        builder.append_path_with_name(path, name)?;
    }

    // The merged configuration is the single most useful diagnostic.
    let dump = cfg.dump()?;
    let mut header = Header::new_gnu();
    header.set_size(dump.len() as u64);
    header.set_mode(0o400);
    header.set_cksum();
    builder.append_data(&mut header, CONFIG_ENTRY_NAME, dump.as_bytes())?;
    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tar::Archive;

    #[test]
    fn test_archive_contains_log_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("install.log");
        fs::write(&log, "stage output\n").unwrap();

        let yaml = format!("install:\n  log_file: {}\n", log.display());
        let cfg = Config::from_mapping(Config::parse_fragment(&yaml).unwrap());

        let tarfile = dir.path().join("errors/archive.tar");
        create_log_tarfile(&tarfile, &cfg).unwrap();

        let mut names = Vec::new();
        let mut archive = Archive::new(File::open(&tarfile).unwrap());
        for entry in archive.entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert!(names.iter().any(|n| n.ends_with("install.log")));
        assert!(names.contains(&CONFIG_ENTRY_NAME.to_string()));
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_mapping(
            Config::parse_fragment("install:\n  log_file: /nonexistent/install.log\n").unwrap(),
        );
        let tarfile = dir.path().join("archive.tar");
        create_log_tarfile(&tarfile, &cfg).unwrap();
        assert!(tarfile.is_file());
    }
}
