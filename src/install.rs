//! Install orchestration
//!
//! Drives one install attempt end to end: bootstrap has already produced
//! the configuration, this module builds the working environment, runs the
//! configured stages in order, handles kexec preparation, and guarantees
//! cleanup (log preservation, unmount ordering, resource export) on both
//! the success and the failure path before the original outcome is
//! returned to the caller.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_yaml::Value;

use crate::collect_logs::create_log_tarfile;
use crate::config::{Config, InstallOptions};
use crate::error::{InstallError, Result};
use crate::kexec::apply_kexec;
use crate::power::apply_power_state;
use crate::reporter::{EventSink, ReportLevel, Reporter};
use crate::stage::Stage;
use crate::teardown;
use crate::util::{ensure_dir, write_file};
use crate::workdir::WorkingDir;

fn start_msg() -> String {
    format!(
        "groundwork: Installation started. ({})",
        env!("CARGO_PKG_VERSION")
    )
}

const INSTALL_PASS_MSG: &str = "groundwork: Installation finished.";

fn fail_msg(e: &InstallError) -> String {
    format!("groundwork: Installation failed with exception: {e}")
}

/// Human descriptions for the well-known stages, used as reporting scope
/// descriptions.
fn stage_description(name: &str) -> String {
    match name {
        "early" => "preparing for installation".to_string(),
        "partitioning" => "configuring storage".to_string(),
        "network" => "configuring network".to_string(),
        "extract" => "writing install sources to disk".to_string(),
        "curthooks" => "configuring installed system".to_string(),
        "hook" => "finalizing installation".to_string(),
        "late" => "executing late commands".to_string(),
        other => format!("stage {other}"),
    }
}

/// Truncate the install log so no previous installation is present.
/// Best-effort.
fn clear_install_log(logfile: &Path) {
    if let Some(parent) = logfile.parent() {
        let _ = ensure_dir(parent);
    }
    let _ = fs::write(logfile, b"");
}

/// Append a line to the install log. Best-effort: the install must not
/// fail merely because logging failed.
fn writeline(logfile: &Path, message: &str) {
    let _ = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)
        .and_then(|mut f| writeln!(f, "{message}"));
}

fn writeline_and_stdout(logfile: &Path, message: &str) {
    writeline(logfile, message);
    println!("{message}");
}

/// Resolve a path inside the target filesystem.
fn target_path(target: &Path, path: &Path) -> std::path::PathBuf {
    match path.strip_prefix("/") {
        Ok(rel) => target.join(rel),
        Err(_) => target.join(path),
    }
}

/// Copy the install log into the target system. Best-effort.
fn copy_install_log(logfile: &Path, target: &Path, log_target_path: &Path) {
    if !logfile.is_file() {
        warn!(
            "cannot copy install log '{}' to target: file does not exist",
            logfile.display()
        );
        return;
    }
    debug!(
        "copying install log from {} to target/{}",
        logfile.display(),
        log_target_path.display()
    );
    let dest = target_path(target, log_target_path);
    match fs::read(logfile) {
        Ok(content) => {
            if let Err(e) = write_file(&dest, &content, 0o400) {
                warn!("cannot copy install log to {}: {e}", dest.display());
            }
        }
        Err(e) => warn!("cannot read install log {}: {e}", logfile.display()),
    }
}

/// Run one full install attempt.
///
/// Returns `Ok(())` only after every stage, the optional kexec
/// preparation, cleanup, and the optional power-state hand-off complete.
/// Any stage-execution error is returned to the caller, but only after
/// cleanup has run.
pub fn run_install(cfg: &Config, sink: Arc<dyn EventSink>) -> Result<()> {
    let opts = cfg.install_options();
    clear_install_log(&opts.log_file);

    let mut reporter = Reporter::new(sink);
    reporter.set_post_files(opts.post_files.clone());

    info!("{}", start_msg());
    debug!("LANG={}", std::env::var("LANG").unwrap_or_default());
    writeline_and_stdout(&opts.log_file, &start_msg());

    let mut workdir = None;
    let result = run_stages(cfg, &opts, &mut workdir, &reporter);

    let result = match result {
        Ok(kexec_applied) => {
            writeline_and_stdout(&opts.log_file, INSTALL_PASS_MSG);
            reporter.report_success();
            Ok(kexec_applied)
        }
        Err(e) => {
            let msg = fail_msg(&e);
            writeline(&opts.log_file, &msg);
            error!("{msg}");
            reporter.report_failure(&msg);
            if let Some(tarfile) = &opts.error_tarfile {
                if let Err(archive_err) = create_log_tarfile(tarfile, cfg) {
                    warn!("failed to create error archive: {archive_err}");
                }
            }
            Err(e)
        }
    };

    // Cleanup runs on both arms before the outcome propagates.
    let cleanup_result = cleanup(cfg, &opts, workdir.as_ref());
    let kexec_applied = match (result, cleanup_result) {
        (Err(e), Err(cleanup_err)) => {
            warn!("cleanup failed after install error: {cleanup_err}");
            return Err(e);
        }
        (Err(e), Ok(())) => return Err(e),
        (Ok(_), Err(cleanup_err)) => return Err(cleanup_err),
        (Ok(kexec_applied), Ok(())) => kexec_applied,
    };

    // A staged kexec turns whatever was configured into an immediate
    // reboot.
    if kexec_applied {
        let pstate: Value = serde_yaml::from_str(
            "mode: reboot\ndelay: now\nmessage: rebooting with kexec\n",
        )?;
        apply_power_state(Some(&pstate))?;
    } else {
        apply_power_state(cfg.power_state())?;
    }
    Ok(())
}

/// Build the working environment and run every configured stage in order.
/// Returns whether a kexec kernel was staged.
fn run_stages(
    cfg: &Config,
    opts: &InstallOptions,
    workdir: &mut Option<WorkingDir>,
    reporter: &Reporter,
) -> Result<bool> {
    let wd = workdir.insert(WorkingDir::create(cfg)?);

    let disk_images = cfg
        .sources()?
        .iter()
        .filter(|s| s.is_disk_image())
        .count();
    if disk_images > 1 {
        return Err(InstallError::config(
            "you may not use more than one disk image",
        ));
    }

    debug!("working environment: {:?}", wd.env());
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(wd.env());
    env.extend(cfg.proxy_env());

    for name in cfg.stages() {
        let scope = reporter.scope().child(
            &format!("stage-{name}"),
            &stage_description(&name),
            ReportLevel::Info,
        );
        let commands = cfg.stage_commands(&name);
        let stage = Stage::new(
            &name,
            &commands,
            env.clone(),
            scope.clone(),
            Some(&opts.log_file),
        )?;
        scope.run(|| stage.run())?;
    }

    apply_kexec(cfg.kexec(), wd.target())
}

/// Ordered teardown of one install attempt. Runs on success and failure.
///
/// Log preservation first, then (unless disabled) recursive unmount of the
/// target, iSCSI session-service restart, pool export, and finally removal
/// of the private working root.
fn cleanup(cfg: &Config, opts: &InstallOptions, workdir: Option<&WorkingDir>) -> Result<()> {
    if let (Some(dest), Some(wd)) = (&opts.save_install_log, workdir) {
        copy_install_log(&opts.log_file, wd.target(), dest);
    }

    if opts.unmount_disabled {
        info!("skipping unmount: config disabled target unmounting");
        return Ok(());
    }
    let Some(wd) = workdir else {
        return Ok(());
    };

    teardown::unmount_target(wd.target())?;

    // The session service, not this process, must own ending active iSCSI
    // sessions; stopping them here first can hang layered storage (for
    // example RAID over iSCSI volumes) during host shutdown.
    if teardown::has_iscsi_volumes(cfg) {
        teardown::restart_iscsi_service()?;
    }
    for pool in teardown::zpools_in_config(cfg) {
        debug!("exporting zpool {pool}");
        teardown::zpool_export(&pool)?;
    }

    fs::remove_dir_all(wd.top())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_descriptions() {
        assert_eq!(stage_description("early"), "preparing for installation");
        assert_eq!(stage_description("partitioning"), "configuring storage");
        assert_eq!(stage_description("custom"), "stage custom");
    }

    #[test]
    fn test_target_path_strips_leading_slash() {
        assert_eq!(
            target_path(Path::new("/tmp/t"), Path::new("/root/install.log")),
            Path::new("/tmp/t/root/install.log")
        );
        assert_eq!(
            target_path(Path::new("/tmp/t"), Path::new("root/install.log")),
            Path::new("/tmp/t/root/install.log")
        );
    }

    #[test]
    fn test_clear_install_log_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sub/install.log");
        clear_install_log(&log);
        assert!(log.is_file());
        writeline(&log, "one");
        writeline(&log, "two");
        assert_eq!(fs::read_to_string(&log).unwrap(), "one\ntwo\n");
        clear_install_log(&log);
        assert_eq!(fs::read_to_string(&log).unwrap(), "");
    }

    #[test]
    fn test_writeline_best_effort_on_bad_path() {
        writeline(Path::new("/proc/not/a/real/log"), "ignored");
    }

    #[test]
    fn test_copy_install_log_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("install.log");
        fs::write(&log, "contents\n").unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        copy_install_log(&log, &target, Path::new("/root/saved.log"));
        let dest = target.join("root/saved.log");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "contents\n");
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn test_copy_install_log_missing_source_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        copy_install_log(
            &dir.path().join("nope.log"),
            dir.path(),
            Path::new("/root/saved.log"),
        );
        assert!(!dir.path().join("root").exists());
    }
}
