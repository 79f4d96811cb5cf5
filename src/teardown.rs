//! Host-side resource teardown after an install attempt
//!
//! Unmounts everything under the target, hands active network-block
//! sessions back to their owning service, and exports copy-on-write pools.
//! Ordering matters: the iSCSI session service must be poked before pool
//! export, and the working root is only removed after both, or layered
//! storage (such as RAID over iSCSI volumes) can hang the host session.

use std::fs;
use std::path::Path;

use log::debug;
use serde_yaml::Value;

use crate::config::Config;
use crate::error::Result;
use crate::util::subp;

/// Decode the octal escapes `/proc/mounts` uses for whitespace in paths.
fn decode_mount_path(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\134", "\\")
}

/// Mount points at or below `target`, deepest first, parsed from
/// `/proc/mounts`-format text.
fn mounts_under(mounts: &str, target: &Path) -> Vec<String> {
    let prefix = format!("{}/", target.display());
    let mut points: Vec<String> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(decode_mount_path)
        .filter(|mp| mp == &target.display().to_string() || mp.starts_with(&prefix))
        .collect();
    // Stable sort: stacked mounts on the same path stay in order and each
    // gets its own umount.
    points.sort_by_key(|mp| std::cmp::Reverse(mp.matches('/').count()));
    points
}

/// Recursively unmount everything mounted under `target`.
pub fn unmount_target(target: &Path) -> Result<()> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    for mount_point in mounts_under(&mounts, target) {
        debug!("unmounting {mount_point}");
        subp(&["umount", &mount_point])?;
    }
    Ok(())
}

fn storage_type_entries(cfg: &Config, wanted: &str) -> Vec<serde_yaml::Mapping> {
    cfg.storage_entries()
        .into_iter()
        .filter(|entry| entry.get("type").and_then(Value::as_str) == Some(wanted))
        .collect()
}

/// True when the storage configuration declares iSCSI volumes.
pub fn has_iscsi_volumes(cfg: &Config) -> bool {
    !storage_type_entries(cfg, "iscsi").is_empty()
}

/// Restart the host's iSCSI session service so that it, not the installer,
/// owns tearing down the active sessions on shutdown.
pub fn restart_iscsi_service() -> Result<()> {
    subp(&["systemctl", "reload-or-restart", "open-iscsi"])?;
    Ok(())
}

/// Pools of the copy-on-write volume manager named in the storage
/// configuration.
pub fn zpools_in_config(cfg: &Config) -> Vec<String> {
    storage_type_entries(cfg, "zpool")
        .iter()
        .filter_map(|entry| entry.get("pool").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Export a pool so the target system can import it on first boot.
pub fn zpool_export(pool: &str) -> Result<()> {
    subp(&["zpool", "export", pool])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/sda1 /tmp/wd/target ext4 rw 0 0
proc /proc proc rw 0 0
/dev/sda2 /tmp/wd/target/boot ext4 rw 0 0
/dev/sda3 /tmp/wd/target/boot/efi vfat rw 0 0
tmpfs /tmp/wd/targetfoo tmpfs rw 0 0
";

    #[test]
    fn test_mounts_under_deepest_first() {
        let points = mounts_under(MOUNTS, Path::new("/tmp/wd/target"));
        assert_eq!(
            points,
            vec![
                "/tmp/wd/target/boot/efi",
                "/tmp/wd/target/boot",
                "/tmp/wd/target"
            ]
        );
    }

    #[test]
    fn test_sibling_prefix_not_matched() {
        let points = mounts_under(MOUNTS, Path::new("/tmp/wd/target"));
        assert!(!points.iter().any(|p| p.contains("targetfoo")));
    }

    #[test]
    fn test_mount_path_escapes_decoded() {
        let mounts = "/dev/sdb1 /tmp/wd/target/with\\040space ext4 rw 0 0\n";
        let points = mounts_under(mounts, Path::new("/tmp/wd/target"));
        assert_eq!(points, vec!["/tmp/wd/target/with space"]);
    }

    #[test]
    fn test_unmount_nothing_mounted_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        unmount_target(dir.path()).unwrap();
    }

    fn cfg(yaml: &str) -> Config {
        Config::from_mapping(Config::parse_fragment(yaml).unwrap())
    }

    #[test]
    fn test_iscsi_detection() {
        let with = cfg("storage:\n  config:\n    - type: iscsi\n      id: d0\n");
        assert!(has_iscsi_volumes(&with));
        let without = cfg("storage:\n  config:\n    - type: disk\n      id: d0\n");
        assert!(!has_iscsi_volumes(&without));
        assert!(!has_iscsi_volumes(&cfg("sources: {}\n")));
    }

    #[test]
    fn test_zpool_names() {
        let c = cfg(
            "storage:\n  config:\n    - type: zpool\n      pool: rpool\n    - type: zpool\n      pool: bpool\n    - type: disk\n      id: d0\n",
        );
        assert_eq!(zpools_in_config(&c), vec!["rpool", "bpool"]);
    }
}
