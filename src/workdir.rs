//! Working environment for one install attempt
//!
//! A private temporary root holds the target mount point, a scratch area,
//! and the state files stage commands read and write. The paths are handed
//! to every stage command through environment variables; that mapping is
//! the only contract between the orchestrator and stage implementations.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::Config;
use crate::error::{InstallError, Result};
use crate::util::ensure_dir;

/// The private filesystem hierarchy for one install attempt.
///
/// Dropping a `WorkingDir` does NOT remove the temporary root; the cleanup
/// orchestrator removes it explicitly once unmounting has finished, since
/// removing it while the target is still mounted would delete installed
/// files.
#[derive(Debug)]
pub struct WorkingDir {
    top: PathBuf,
    scratch: PathBuf,
    target: PathBuf,
    fstab: PathBuf,
    netconf: PathBuf,
    netstate: PathBuf,
    interfaces: PathBuf,
    config_file: PathBuf,
}

impl WorkingDir {
    /// Create the working hierarchy and snapshot the configuration into it.
    ///
    /// Fails with a configuration error if a user-specified target
    /// directory cannot be created or is not empty.
    pub fn create(config: &Config) -> Result<Self> {
        // keep() detaches the TempDir guard; removal is owned by the
        // cleanup phase.
        let top = TempDir::new()?.keep();
        let state = top.join("state");
        let scratch = top.join("scratch");
        for dir in [&state, &scratch] {
            fs::create_dir(dir)?;
        }

        let target = match config.install_options().target {
            Some(t) => t,
            None => top.join("target"),
        };
        ensure_dir(&target).map_err(|e| {
            InstallError::config(format!(
                "unable to create target directory '{}': {e}",
                target.display()
            ))
        })?;
        if fs::read_dir(&target)?.next().is_some() {
            return Err(InstallError::config(format!(
                "provided target dir '{}' was not empty",
                target.display()
            )));
        }

        let config_file = state.join("config");
        fs::write(&config_file, config.dump_json()?)?;

        let fstab = state.join("fstab");
        let netconf = state.join("network_config");
        let netstate = state.join("network_state");
        let interfaces = state.join("interfaces");
        // Touch the output placeholders so stage commands can always append
        // to them, whichever stage runs first.
        for f in [&fstab, &netconf, &netstate, &interfaces] {
            OpenOptions::new().create(true).append(true).open(f)?;
        }

        Ok(Self {
            top,
            scratch,
            target,
            fstab,
            netconf,
            netstate,
            interfaces,
            config_file,
        })
    }

    /// The environment-variable contract offered to stage commands.
    pub fn env(&self) -> HashMap<String, String> {
        let path = |p: &Path| p.to_string_lossy().into_owned();
        HashMap::from([
            ("WORKING_DIR".to_string(), path(&self.scratch)),
            ("OUTPUT_FSTAB".to_string(), path(&self.fstab)),
            ("OUTPUT_INTERFACES".to_string(), path(&self.interfaces)),
            ("OUTPUT_NETWORK_CONFIG".to_string(), path(&self.netconf)),
            ("OUTPUT_NETWORK_STATE".to_string(), path(&self.netstate)),
            ("TARGET_MOUNT_POINT".to_string(), path(&self.target)),
            ("CONFIG".to_string(), path(&self.config_file)),
        ])
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_yaml::Mapping;

    fn cfg_with_target(target: &Path) -> Config {
        let yaml = format!("install:\n  target: {}\n", target.display());
        Config::from_mapping(Config::parse_fragment(&yaml).unwrap())
    }

    #[test]
    fn test_create_default_target() {
        let wd = WorkingDir::create(&Config::from_mapping(Mapping::new())).unwrap();
        assert!(wd.top().is_dir());
        assert!(wd.target().is_dir());
        assert_eq!(fs::read_dir(wd.target()).unwrap().count(), 0);
        fs::remove_dir_all(wd.top()).unwrap();
    }

    #[test]
    fn test_state_files_exist() {
        let wd = WorkingDir::create(&Config::from_mapping(Mapping::new())).unwrap();
        for f in ["config", "fstab", "network_config", "network_state", "interfaces"] {
            assert!(wd.top().join("state").join(f).is_file(), "missing {f}");
        }
        // placeholders start out empty
        assert!(fs::metadata(wd.top().join("state/fstab")).unwrap().len() == 0);
        fs::remove_dir_all(wd.top()).unwrap();
    }

    #[test]
    fn test_config_snapshot_is_json() {
        let cfg = Config::from_mapping(Config::parse_fragment("stages: [early]\n").unwrap());
        let wd = WorkingDir::create(&cfg).unwrap();
        let text = fs::read_to_string(wd.top().join("state/config")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["stages"][0], "early");
        fs::remove_dir_all(wd.top()).unwrap();
    }

    #[test]
    fn test_env_contract_keys() {
        let wd = WorkingDir::create(&Config::from_mapping(Mapping::new())).unwrap();
        let env = wd.env();
        for k in [
            "WORKING_DIR",
            "OUTPUT_FSTAB",
            "OUTPUT_INTERFACES",
            "OUTPUT_NETWORK_CONFIG",
            "OUTPUT_NETWORK_STATE",
            "TARGET_MOUNT_POINT",
            "CONFIG",
        ] {
            assert!(env.contains_key(k), "missing {k}");
        }
        assert_eq!(env["WORKING_DIR"], wd.top().join("scratch").display().to_string());
        fs::remove_dir_all(wd.top()).unwrap();
    }

    #[test]
    fn test_user_target_honored_when_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("mnt");
        let wd = WorkingDir::create(&cfg_with_target(&target)).unwrap();
        assert_eq!(wd.target(), target.as_path());
        fs::remove_dir_all(wd.top()).unwrap();
    }

    #[test]
    fn test_nonempty_target_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("mnt");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("stale"), b"x").unwrap();
        let err = WorkingDir::create(&cfg_with_target(&target)).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
    }
}
