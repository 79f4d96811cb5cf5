//! Power-state command synthesis and detached execution
//!
//! After cleanup the installer may hand the machine a delayed shutdown,
//! reboot, or halt. The actual shutdown runs behind a small sleep-then-exec
//! wrapper that honors an abort marker file, and is spawned in its own
//! session so the installer never waits on it.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use log::{info, warn};
use serde_yaml::Value;

use crate::error::{InstallError, Result};

/// Touch this file to suppress a pending power-state action.
pub const POWEROFF_BLOCK_FILE: &str = "/run/block-groundwork-poweroff";

const DELAY_WRAPPER: &str =
    "sleep \"$1\" && shift; [ -f /run/block-groundwork-poweroff ] && exit 0; exec \"$@\"";

/// Build the shutdown invocation for a `power_state` configuration, or
/// `None` when no power state is configured.
///
/// ```yaml
/// power_state:
///   delay: "+5"
///   mode: poweroff
///   message: Bye Bye
/// ```
pub fn load_power_state(pstate: Option<&Value>) -> Result<Option<Vec<String>>> {
    let pstate = match pstate {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Mapping(m)) => m,
        Some(other) => {
            return Err(InstallError::config(format!(
                "power_state is not a mapping: {other:?}"
            )))
        }
    };

    let mode = pstate.get("mode").and_then(Value::as_str);
    let flag = match mode {
        Some("halt") => "-H",
        Some("poweroff") => "-P",
        Some("reboot") => "-r",
        _ => {
            return Err(InstallError::config(
                "power_state[mode] required, must be one of: halt,poweroff,reboot",
            ))
        }
    };

    let delay = match pstate.get("delay") {
        None | Some(Value::Null) => "5".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(InstallError::config(format!(
                "power_state[delay] is not a string: {other:?}"
            )))
        }
    };
    let delay = normalize_delay(&delay);

    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        DELAY_WRAPPER.to_string(),
        "groundwork-poweroff".to_string(),
        delay,
        "shutdown".to_string(),
        flag.to_string(),
        "now".to_string(),
    ];
    match pstate.get("message") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => {}
        Some(Value::String(s)) => {
            if !s.is_empty() {
                cmd.push(s.clone());
            }
        }
        Some(Value::Number(n)) => cmd.push(n.to_string()),
        Some(Value::Bool(true)) => cmd.push("true".to_string()),
        Some(other) => {
            return Err(InstallError::config(format!(
                "power_state[message] is not a scalar: {other:?}"
            )))
        }
    }
    Ok(Some(cmd))
}

/// `"now"` means immediately; `+N` means N minutes; anything else is a
/// literal delay specifier for the wrapper's sleep.
fn normalize_delay(delay: &str) -> String {
    if delay == "now" {
        return "0".to_string();
    }
    match delay.strip_prefix('+') {
        Some(minutes) if !minutes.is_empty() && minutes.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{minutes}m")
        }
        _ => delay.to_string(),
    }
}

/// Execute the configured power-state action, detached from this process.
///
/// Shape errors propagate; failures of the shutdown command itself are
/// only logged, since by design it may outlive the installer.
pub fn apply_power_state(pstate: Option<&Value>) -> Result<()> {
    let Some(cmd) = load_power_state(pstate)? else {
        return Ok(());
    };
    info!("powering off with {cmd:?}");
    if let Err(e) = spawn_detached(&cmd) {
        warn!("failed to spawn power-state command {cmd:?}: {e}");
    }
    Ok(())
}

/// Spawn a command in a new session with no attached stdio. The child is
/// intentionally never waited on.
fn spawn_detached(argv: &[String]) -> std::io::Result<()> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }
    cmd.spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pstate(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_no_power_state() {
        assert_eq!(load_power_state(None).unwrap(), None);
        assert_eq!(load_power_state(Some(&Value::Null)).unwrap(), None);
    }

    #[test]
    fn test_not_a_mapping_fails() {
        let err = load_power_state(Some(&pstate("reboot"))).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
    }

    #[test]
    fn test_unknown_mode_fails() {
        let err = load_power_state(Some(&pstate("mode: explode"))).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
        let err = load_power_state(Some(&pstate("delay: now"))).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
    }

    #[test]
    fn test_reboot_with_plus_delay() {
        let cmd = load_power_state(Some(&pstate("mode: reboot\ndelay: '+5'\n")))
            .unwrap()
            .unwrap();
        assert_eq!(cmd[0..4], ["sh", "-c", DELAY_WRAPPER, "groundwork-poweroff"]);
        assert_eq!(cmd[4], "5m");
        assert_eq!(cmd[5..8], ["shutdown", "-r", "now"]);
    }

    #[test]
    fn test_delay_now_maps_to_zero() {
        let cmd = load_power_state(Some(&pstate("mode: poweroff\ndelay: now\n")))
            .unwrap()
            .unwrap();
        assert_eq!(cmd[4], "0");
        assert_eq!(cmd[6], "-P");
    }

    #[test]
    fn test_default_delay_and_halt() {
        let cmd = load_power_state(Some(&pstate("mode: halt\n"))).unwrap().unwrap();
        assert_eq!(cmd[4], "5");
        assert_eq!(cmd[6], "-H");
    }

    #[test]
    fn test_literal_delay_passthrough() {
        let cmd = load_power_state(Some(&pstate("mode: reboot\ndelay: 300\n")))
            .unwrap()
            .unwrap();
        assert_eq!(cmd[4], "300");
    }

    #[test]
    fn test_message_appended() {
        let cmd = load_power_state(Some(&pstate("mode: poweroff\nmessage: Bye Bye\n")))
            .unwrap()
            .unwrap();
        assert_eq!(cmd.last().unwrap(), "Bye Bye");
    }

    #[test]
    fn test_numeric_message_stringified() {
        let cmd = load_power_state(Some(&pstate("mode: poweroff\nmessage: 86400\n")))
            .unwrap()
            .unwrap();
        assert_eq!(cmd.last().unwrap(), "86400");
    }

    #[test]
    fn test_non_scalar_message_rejected() {
        let err = load_power_state(Some(&pstate("mode: poweroff\nmessage: [a, b]\n"))).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
    }

    #[test]
    fn test_wrapper_checks_block_file() {
        assert!(DELAY_WRAPPER.contains(POWEROFF_BLOCK_FILE));
    }

    proptest! {
        #[test]
        fn prop_plus_digit_delays_become_minutes(minutes in 0u32..100_000) {
            let yaml = format!("mode: reboot\ndelay: '+{minutes}'\n");
            let cmd = load_power_state(Some(&pstate(&yaml))).unwrap().unwrap();
            prop_assert_eq!(&cmd[4], &format!("{minutes}m"));
        }
    }
}
