//! Configuration bootstrap and access
//!
//! The installer is driven by a declarative YAML configuration. Bootstrap
//! deep-copies the built-in defaults, merges the user documents over them,
//! appends command-line install sources, migrates legacy proxy settings,
//! and injects a config-snapshot entry into `write_files`. After bootstrap
//! the configuration is read-only; every other component borrows it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, warn};
use serde_yaml::{Mapping, Value};

use crate::error::{InstallError, Result};
use crate::util::{sanitize_source, SourceSpec};

pub const INSTALL_LOG: &str = "/var/log/groundwork/install.log";
/// Upon error, groundwork creates a tar of all related logs at ERROR_TARFILE
pub const ERROR_TARFILE: &str = "/var/log/groundwork/error-logs.tar";
pub const SAVE_INSTALL_LOG: &str = "/root/groundwork-install.log";
pub const SAVE_INSTALL_CONFIG: &str = "/root/groundwork-install-cfg.yaml";

/// Built-in defaults. Stage command maps delegate to groundwork's own
/// subcommands; late and apply_net ship empty.
const CONFIG_BUILTIN: &str = r#"
sources: {}
stages: [early, partitioning, network, extract, curthooks, hook, late]
extract_commands:
  builtin: [groundwork, extract]
hook_commands:
  builtin: [groundwork, hook]
partitioning_commands:
  builtin: [groundwork, block-meta, simple]
curthooks_commands:
  builtin: [groundwork, curthooks]
network_commands:
  builtin: [groundwork, net-meta, auto]
late_commands:
  builtin: []
apply_net_commands:
  builtin: []
install:
  log_file: /var/log/groundwork/install.log
  error_tarfile: /var/log/groundwork/error-logs.tar
"#;

/// Values the configuration treats as "explicitly disabled".
fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn key(k: &str) -> Value {
    Value::String(k.to_string())
}

/// The merged install configuration.
#[derive(Debug, Clone)]
pub struct Config(Mapping);

impl Config {
    /// The built-in default configuration.
    pub fn builtin() -> Self {
        let value: Value =
            serde_yaml::from_str(CONFIG_BUILTIN).expect("builtin config must parse");
        match value {
            Value::Mapping(m) => Self(m),
            _ => unreachable!("builtin config is a mapping"),
        }
    }

    /// Parse one YAML document into a configuration fragment.
    pub fn parse_fragment(yaml: &str) -> Result<Mapping> {
        match serde_yaml::from_str(yaml)? {
            Value::Mapping(m) => Ok(m),
            Value::Null => Ok(Mapping::new()),
            other => Err(InstallError::config(format!(
                "config document is not a mapping: {other:?}"
            ))),
        }
    }

    /// Merge `overlay` over this configuration. Nested mappings merge
    /// key-wise; everything else is overwritten by the overlay value.
    pub fn merge(&mut self, overlay: &Mapping) {
        merge_mapping(&mut self.0, overlay);
    }

    /// Build the effective configuration for one install attempt.
    ///
    /// `user_configs` are merged in order over the defaults; each CLI
    /// source is sanitized and appended under a `NN_cmdline` key. Fails
    /// with a usage error when no sources remain and with a configuration
    /// error on a malformed `proxy` section.
    pub fn bootstrap(user_configs: &[Mapping], cli_sources: &[String]) -> Result<Self> {
        let mut cfg = Self::builtin();
        for fragment in user_configs {
            cfg.merge(fragment);
        }

        for source in cli_sources {
            let spec = sanitize_source(source)?;
            cfg.append_source(&spec);
        }

        debug!("merged config: {:?}", cfg.0);
        if cfg.source_map().is_empty() {
            return Err(InstallError::usage("no sources provided to install"));
        }

        cfg.migrate_proxy_settings()?;
        cfg.inject_config_dump()?;
        Ok(cfg)
    }

    fn append_source(&mut self, spec: &SourceSpec) {
        let mut entry = Mapping::new();
        entry.insert(key("type"), Value::String(spec.kind.clone()));
        entry.insert(key("uri"), Value::String(spec.uri.clone()));

        if !matches!(self.0.get(key("sources")), Some(Value::Mapping(_))) {
            self.0.insert(key("sources"), Value::Mapping(Mapping::new()));
        }
        let Some(Value::Mapping(sources)) = self.0.get_mut(key("sources")) else {
            unreachable!("sources ensured above");
        };
        let name = format!("{:02}_cmdline", sources.len());
        sources.insert(key(&name), Value::Mapping(entry));
    }

    /// Move the legacy top-level `http_proxy` into `proxy.http_proxy`.
    /// An existing, differing `proxy.http_proxy` wins with a warning.
    /// `proxy` is always left present as a mapping.
    fn migrate_proxy_settings(&mut self) -> Result<()> {
        let mut proxy = match self.0.get(key("proxy")) {
            None => Mapping::new(),
            Some(Value::Mapping(m)) => m.clone(),
            Some(other) => {
                return Err(InstallError::config(format!(
                    "'proxy' in config is not a mapping: {other:?}"
                )))
            }
        };

        if let Some(legacy) = self.0.remove(key("http_proxy")) {
            if !is_falsy(&legacy) {
                match proxy.get(key("http_proxy")) {
                    Some(existing) if !is_falsy(existing) && *existing != legacy => {
                        warn!(
                            "legacy http_proxy setting ({legacy:?}) differs from \
                             proxy/http_proxy ({existing:?}), using {existing:?}"
                        );
                    }
                    _ => {
                        debug!("legacy 'http_proxy' migrated to proxy/http_proxy");
                        proxy.insert(key("http_proxy"), legacy);
                    }
                }
            }
        }

        self.0.insert(key("proxy"), Value::Mapping(proxy));
        Ok(())
    }

    /// Environment overlay for child processes derived from the `proxy`
    /// section. The ambient process environment is never mutated.
    pub fn proxy_env(&self) -> Vec<(String, String)> {
        let mut overlay = Vec::new();
        if let Some(Value::Mapping(proxy)) = self.0.get(key("proxy")) {
            for var in ["http_proxy", "https_proxy", "no_proxy"] {
                if let Some(Value::String(v)) = proxy.get(key(var)) {
                    overlay.push((var.to_string(), v.clone()));
                }
            }
        }
        overlay
    }

    /// Record a snapshot of this configuration in `write_files` so the
    /// final system keeps a copy, unless the dump destination is disabled.
    fn inject_config_dump(&mut self) -> Result<()> {
        let dest = match self.install_get("save_install_config") {
            Some(v) if is_falsy(&v) => return Ok(()),
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(InstallError::config(format!(
                    "install.save_install_config is not a string: {other:?}"
                )))
            }
            None => SAVE_INSTALL_CONFIG.to_string(),
        };

        // Snapshot excludes the entry being injected.
        let content = self.dump()?;
        let mut entry = Mapping::new();
        entry.insert(key("path"), Value::String(dest));
        entry.insert(key("permissions"), Value::String("0400".to_string()));
        entry.insert(key("owner"), Value::String("root:root".to_string()));
        entry.insert(key("content"), Value::String(content));

        if !matches!(self.0.get(key("write_files")), Some(Value::Mapping(_))) {
            self.0
                .insert(key("write_files"), Value::Mapping(Mapping::new()));
        }
        let Some(Value::Mapping(write_files)) = self.0.get_mut(key("write_files")) else {
            unreachable!("write_files ensured above");
        };
        write_files.insert(key("install_cfg"), Value::Mapping(entry));
        Ok(())
    }

    /// Serialize the full configuration to YAML.
    pub fn dump(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&Value::Mapping(self.0.clone()))?)
    }

    /// Serialize the full configuration to JSON, the snapshot format stage
    /// commands read through `$CONFIG`.
    pub fn dump_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&Value::Mapping(
            self.0.clone(),
        ))?)
    }

    pub fn get(&self, k: &str) -> Option<&Value> {
        self.0.get(key(k))
    }

    fn install_get(&self, k: &str) -> Option<Value> {
        match self.0.get(key("install")) {
            Some(Value::Mapping(m)) => m.get(key(k)).cloned(),
            _ => None,
        }
    }

    fn source_map(&self) -> Mapping {
        match self.0.get(key("sources")) {
            Some(Value::Mapping(m)) => m.clone(),
            _ => Mapping::new(),
        }
    }

    /// All install sources in normalized form.
    pub fn sources(&self) -> Result<Vec<SourceSpec>> {
        let mut specs = Vec::new();
        for (_, v) in &self.source_map() {
            match v {
                Value::String(s) => specs.push(sanitize_source(s)?),
                Value::Mapping(m) => {
                    let kind = m
                        .get(key("type"))
                        .and_then(Value::as_str)
                        .unwrap_or("tgz")
                        .to_string();
                    let uri = m
                        .get(key("uri"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    specs.push(SourceSpec { kind, uri });
                }
                other => {
                    return Err(InstallError::config(format!(
                        "invalid source entry: {other:?}"
                    )))
                }
            }
        }
        Ok(specs)
    }

    /// The ordered stage list.
    pub fn stages(&self) -> Vec<String> {
        match self.0.get(key("stages")) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The `{stage}_commands` map, keyed and iterated by command name.
    pub fn stage_commands(&self, stage: &str) -> BTreeMap<String, Value> {
        let mut commands = BTreeMap::new();
        if let Some(Value::Mapping(m)) = self.0.get(key(&format!("{stage}_commands"))) {
            for (k, v) in m {
                if let Some(name) = k.as_str() {
                    commands.insert(name.to_string(), v.clone());
                }
            }
        }
        commands
    }

    pub fn power_state(&self) -> Option<&Value> {
        self.get("power_state")
    }

    pub fn kexec(&self) -> Option<&Value> {
        self.get("kexec")
    }

    /// Entries of `storage.config`, used for teardown decisions.
    pub fn storage_entries(&self) -> Vec<Mapping> {
        let storage = match self.0.get(key("storage")) {
            Some(Value::Mapping(m)) => m,
            _ => return Vec::new(),
        };
        match storage.get(key("config")) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| match v {
                    Value::Mapping(m) => Some(m.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Resolved `install` section options.
    pub fn install_options(&self) -> InstallOptions {
        let log_file = match self.install_get("log_file") {
            Some(Value::String(s)) if !s.is_empty() => PathBuf::from(s),
            _ => PathBuf::from(INSTALL_LOG),
        };
        let error_tarfile = match self.install_get("error_tarfile") {
            Some(Value::String(s)) if !s.is_empty() => Some(PathBuf::from(s)),
            _ => None,
        };
        let target = match self.install_get("target") {
            Some(Value::String(s)) if !s.is_empty() => Some(PathBuf::from(s)),
            _ => None,
        };
        let save_install_log = match self.install_get("save_install_log") {
            Some(v) if is_falsy(&v) => None,
            Some(Value::String(s)) => Some(PathBuf::from(s)),
            Some(_) | None => Some(PathBuf::from(SAVE_INSTALL_LOG)),
        };
        let unmount_disabled =
            matches!(self.install_get("unmount"), Some(Value::String(s)) if s == "disabled");
        let post_files = match self.install_get("post_files") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect(),
            _ => vec![log_file.clone()],
        };

        InstallOptions {
            log_file,
            error_tarfile,
            target,
            save_install_log,
            unmount_disabled,
            post_files,
        }
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_mapping(m: Mapping) -> Self {
        Self(m)
    }
}

fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (k, v) in overlay {
        match (base.get_mut(k), v) {
            (Some(Value::Mapping(b)), Value::Mapping(o)) => merge_mapping(b, o),
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Options from the `install` section, resolved with defaults.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub log_file: PathBuf,
    pub error_tarfile: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub save_install_log: Option<PathBuf>,
    pub unmount_disabled: bool,
    pub post_files: Vec<PathBuf>,
}
