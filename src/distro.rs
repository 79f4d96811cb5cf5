//! Package installation in the ephemeral install environment.

use log::info;

use crate::error::Result;
use crate::util::subp_env;

/// Install packages on the host running the installer (not the target).
/// Used when a tool the install needs, such as kexec, is missing.
pub fn install_packages(packages: &[&str]) -> Result<()> {
    info!("installing packages: {}", packages.join(" "));
    let mut args = vec!["apt-get", "install", "--quiet", "--assume-yes"];
    args.extend_from_slice(packages);
    subp_env(&args, &[("DEBIAN_FRONTEND", "noninteractive")])?;
    Ok(())
}
