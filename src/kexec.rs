//! Kernel re-exec preparation
//!
//! When the configuration requests it, the installed system's boot-loader
//! configuration is parsed to find the default entry's kernel, arguments,
//! and initrd, and the re-exec tool is invoked to stage them so the next
//! shutdown boots straight into the new kernel.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error};
use serde_yaml::Value;

use crate::distro;
use crate::error::{InstallError, Result};
use crate::util::subp;

const GRUB_CFG: &str = "boot/grub/grub.cfg";

/// The default boot entry resolved from the boot-loader configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    /// Zero-based index of the entry within the configuration.
    pub index: usize,
    /// Kernel image path, resolved under the target root.
    pub kernel: PathBuf,
    /// Boot argument string following the kernel image path.
    pub append: String,
    /// Initrd path, resolved under the target root, when declared.
    pub initrd: Option<PathBuf>,
}

fn word_in(line: &str, word: &str) -> bool {
    line.split_whitespace().any(|w| w == word)
}

/// Resolve the default boot entry from boot-loader configuration text.
///
/// The default index comes from the last `set default="N"` assignment
/// (zero when absent); entry bodies span from one `menuentry` marker line
/// to the next, or to end of file for the last entry. A configuration
/// with no entry markers, an out-of-range default, or no kernel directive
/// in the chosen body yields `None` with an error logged; callers treat
/// that as "no boot entry found", not a fatal error.
pub fn parse_default_boot_entry(content: &str, target: &Path) -> Option<BootEntry> {
    let lines: Vec<&str> = content.lines().collect();

    let mut default = 0usize;
    let mut menu_lines = Vec::new();
    for (num, line) in lines.iter().enumerate() {
        if let Some(rest) = line.trim_start().strip_prefix("set default=\"") {
            if let Some(digits) = rest.split('"').next() {
                if let Ok(n) = digits.parse() {
                    default = n;
                }
            }
        }
        if word_in(line, "menuentry") {
            menu_lines.push(num);
        }
    }

    if menu_lines.is_empty() {
        error!("grub config file does not have a menuentry");
        return None;
    }
    let Some(&begin) = menu_lines.get(default) else {
        error!("grub config default entry {default} is out of range");
        return None;
    };
    let end = menu_lines.get(default + 1).copied().unwrap_or(lines.len());

    let mut kernel = None;
    let mut append = String::new();
    let mut initrd = None;
    for line in &lines[begin..end] {
        let words: Vec<&str> = line.split_whitespace().collect();
        if kernel.is_none() && word_in(line, "linux") && words.len() >= 2 {
            kernel = Some(target.join(words[1].trim_start_matches('/')));
            append = words[2..].join(" ");
        }
        if initrd.is_none() && word_in(line, "initrd") && words.len() >= 2 {
            initrd = Some(target.join(words[1].trim_start_matches('/')));
        }
    }

    let Some(kernel) = kernel else {
        error!("grub config file does not have a kernel");
        return None;
    };
    Some(BootEntry {
        index: default,
        kernel,
        append,
        initrd,
    })
}

/// Stage the installed system's default kernel for re-exec.
///
/// No-op (returns false) when `kexec.mode` is not `"on"`. Installs the
/// re-exec tool if it is missing. Returns true once the kernel has been
/// staged; a boot configuration without a usable entry returns false.
pub fn apply_kexec(kexec: Option<&Value>, target: &Path) -> Result<bool> {
    let kexec = match kexec {
        None | Some(Value::Null) => return Ok(false),
        Some(Value::Mapping(m)) => m,
        Some(other) => {
            return Err(InstallError::config(format!(
                "kexec is not a mapping: {other:?}"
            )))
        }
    };
    if kexec.get("mode").and_then(Value::as_str) != Some("on") {
        return Ok(false);
    }

    if which::which("kexec").is_err() {
        distro::install_packages(&["kexec-tools"])?;
    }

    let grubcfg = target.join(GRUB_CFG);
    if !grubcfg.is_file() {
        return Err(InstallError::config(format!(
            "{GRUB_CFG} does not exist in target"
        )));
    }

    let content = fs::read_to_string(&grubcfg)?;
    let Some(entry) = parse_default_boot_entry(&content, target) else {
        return Ok(false);
    };

    let kernel = entry.kernel.display().to_string();
    let append = format!("--append={}", entry.append);
    let initrd = entry
        .initrd
        .as_ref()
        .map(|p| format!("--initrd={}", p.display()));
    debug!("kexec -l {kernel} {append} {initrd:?}");

    let mut args = vec!["kexec", "-l", kernel.as_str(), append.as_str()];
    if let Some(initrd) = initrd.as_deref() {
        args.push(initrd);
    }
    subp(&args)?;
    Ok(true)
}
