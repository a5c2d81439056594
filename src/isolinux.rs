//! isolinux.cfg boot menu entries
//!
//! Entries are only ever appended to an existing configuration, so every boot option
//! the source image shipped with stays selectable.

use std::{
    fmt::{self, Display, Formatter},
    fs::{read, OpenOptions},
    io::{ErrorKind, Write},
    path::Path,
};

use derive_builder::Builder;
use log::{info, warn};

use crate::error::{Error, Result};

pub const ISOLINUX_DIR: &str = "isolinux";
pub const ISOLINUX_CFG: &str = "isolinux.cfg";
pub const DEFAULT_LABEL: &str = "kickstart";

/// Where the installer fetches the kickstart from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KsLocation {
    /// A path relative to the root of the install media
    Cdrom(String),
    /// Any other location understood by `inst.ks=`, passed through unchanged
    Other(String),
}

impl Display for KsLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KsLocation::Cdrom(path) => write!(f, "cdrom:/{}", path.trim_start_matches('/')),
            KsLocation::Other(location) => write!(f, "{}", location),
        }
    }
}

/// A `label` stanza in isolinux.cfg that boots the installer with a kickstart
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct BootEntry {
    #[builder(default = "DEFAULT_LABEL.to_string()")]
    label: String,
    /// Text shown in the menu, `^` marks the hotkey
    #[builder(default = "\"^Install system with kickstart\".to_string()")]
    menu_label: String,
    /// Emit `menu default`
    #[builder(default = "true")]
    menu_default: bool,
    #[builder(default = "\"vmlinuz\".to_string()")]
    kernel: String,
    #[builder(default = "\"initrd.img\".to_string()")]
    initrd: String,
    kickstart: KsLocation,
    /// Kernel arguments after `inst.ks=`
    #[builder(default = "vec![\"quiet\".to_string()]")]
    extra_args: Vec<String>,
}

impl BootEntry {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kickstart(&self) -> &KsLocation {
        &self.kickstart
    }

    pub fn append_line(&self) -> String {
        let mut args = vec![
            format!("initrd={}", self.initrd),
            format!("inst.ks={}", self.kickstart),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.join(" ")
    }
}

impl Display for BootEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "label {}", self.label)?;
        writeln!(f, "  menu label {}", self.menu_label)?;
        if self.menu_default {
            writeln!(f, "  menu default")?;
        }
        writeln!(f, "  kernel {}", self.kernel)?;
        writeln!(f, "  append {}", self.append_line())
    }
}

/// Split a config line into its lowercased keyword and the rest. Keywords are case
/// insensitive in syslinux.
fn directive(line: &str) -> Option<(String, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Some((keyword.to_ascii_lowercase(), rest.trim()))
}

/// All labels defined in a config, in order
pub fn labels(cfg: &str) -> Vec<String> {
    cfg.lines()
        .filter_map(directive)
        .filter(|(keyword, _)| keyword == "label")
        .map(|(_, rest)| rest.to_string())
        .collect()
}

/// The label syslinux selects by default. With several `menu default` markers the last
/// one read wins.
pub fn effective_default(cfg: &str) -> Option<String> {
    let mut current = None;
    let mut default = None;
    for (keyword, rest) in cfg.lines().filter_map(directive) {
        match keyword.as_str() {
            "label" => current = Some(rest.to_string()),
            "menu" if rest.eq_ignore_ascii_case("default") => {
                if current.is_some() {
                    default = current.clone();
                }
            }
            _ => {}
        }
    }
    default
}

/// `base` if no stanza uses it yet, otherwise the first free `base-N`
pub fn unique_label(cfg: &str, base: &str) -> String {
    let existing = labels(cfg);
    if !existing.iter().any(|l| l == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Append a boot entry that installs with the kickstart at `kickstart_path`, a path
/// relative to the root of the staged tree.
pub fn patch(cfg_path: &Path, kickstart_path: &str) -> Result<BootEntry> {
    let existing = match read(cfg_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(
                "{} does not exist, creating it",
                cfg_path.to_string_lossy()
            );
            String::new()
        }
        Err(e) => return Err(Error::io(cfg_path, e)),
    };

    let entry = BootEntryBuilder::default()
        .label(unique_label(&existing, DEFAULT_LABEL))
        .kickstart(KsLocation::Cdrom(kickstart_path.to_string()))
        .build()
        .map_err(|e| {
            Error::io(
                cfg_path,
                std::io::Error::new(ErrorKind::InvalidInput, e.to_string()),
            )
        })?;

    let mut cfg = OpenOptions::new()
        .create(true)
        .append(true)
        .open(cfg_path)
        .map_err(|e| Error::io(cfg_path, e))?;
    write!(cfg, "\n{}", entry).map_err(|e| Error::io(cfg_path, e))?;

    info!(
        "Added boot entry '{}' to {}: {}",
        entry.label,
        cfg_path.to_string_lossy(),
        entry.append_line()
    );

    Ok(entry)
}

#[cfg(test)]
const FEDORA_CFG: &str = "default vesamenu.c32
timeout 600

menu title Fedora-Workstation-Live 40

label linux
  menu label ^Start Fedora-Workstation-Live 40
  kernel vmlinuz
  append initrd=initrd.img root=live:CDLABEL=Fedora-WS-Live-40 rd.live.image quiet rhgb

label check
  menu label Test this ^media & start Fedora-Workstation-Live 40
  menu default
  kernel vmlinuz
  append initrd=initrd.img root=live:CDLABEL=Fedora-WS-Live-40 rd.live.image rd.live.check quiet
";

#[test]
fn test_entry_display() {
    let entry = BootEntryBuilder::default()
        .kickstart(KsLocation::Cdrom("isolinux/auto.cfg".to_string()))
        .build()
        .unwrap();

    assert_eq!(
        entry.to_string(),
        "label kickstart
  menu label ^Install system with kickstart
  menu default
  kernel vmlinuz
  append initrd=initrd.img inst.ks=cdrom:/isolinux/auto.cfg quiet
"
    );
}

#[test]
fn test_entry_not_default() {
    let entry = BootEntryBuilder::default()
        .label("ks-text")
        .menu_default(false)
        .extra_args(vec!["inst.text".to_string()])
        .kickstart(KsLocation::Other("http://10.0.0.1/ks.cfg".to_string()))
        .build()
        .unwrap();

    assert!(!entry.to_string().contains("menu default"));
    assert_eq!(
        entry.append_line(),
        "initrd=initrd.img inst.ks=http://10.0.0.1/ks.cfg inst.text"
    );
}

#[test]
fn test_labels_and_default() {
    assert_eq!(labels(FEDORA_CFG), vec!["linux", "check"]);
    assert_eq!(effective_default(FEDORA_CFG), Some("check".to_string()));
    assert_eq!(effective_default("label a\n  kernel vmlinuz\n"), None);
}

#[test]
fn test_unique_label() {
    assert_eq!(unique_label(FEDORA_CFG, "kickstart"), "kickstart");
    assert_eq!(
        unique_label("label kickstart\nLABEL kickstart-2\n", "kickstart"),
        "kickstart-3"
    );
}

#[test]
fn test_patch_appends() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join(ISOLINUX_CFG);
    std::fs::write(&cfg, FEDORA_CFG).unwrap();

    let entry = patch(&cfg, "isolinux/auto.cfg").unwrap();
    assert_eq!(entry.label(), "kickstart");

    let patched = std::fs::read_to_string(&cfg).unwrap();
    assert!(patched.starts_with(FEDORA_CFG));
    assert!(patched.ends_with(
        "\nlabel kickstart
  menu label ^Install system with kickstart
  menu default
  kernel vmlinuz
  append initrd=initrd.img inst.ks=cdrom:/isolinux/auto.cfg quiet
"
    ));
    // The old default marker stays, the appended one is read last and wins
    assert_eq!(patched.matches("menu default").count(), 2);
    assert_eq!(effective_default(&patched), Some("kickstart".to_string()));
}

#[test]
fn test_patch_twice_appends_twice() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join(ISOLINUX_CFG);
    std::fs::write(&cfg, FEDORA_CFG).unwrap();

    patch(&cfg, "isolinux/auto.cfg").unwrap();
    let once = std::fs::read_to_string(&cfg).unwrap();
    let second = patch(&cfg, "isolinux/auto.cfg").unwrap();
    let twice = std::fs::read_to_string(&cfg).unwrap();

    assert_eq!(second.label(), "kickstart-2");
    assert!(twice.starts_with(&once));
    assert_eq!(labels(&twice), vec!["linux", "check", "kickstart", "kickstart-2"]);
    assert_eq!(
        twice.matches("inst.ks=cdrom:/isolinux/auto.cfg").count(),
        2
    );
}

#[test]
fn test_patch_missing_cfg() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join(ISOLINUX_CFG);

    patch(&cfg, "isolinux/auto.cfg").unwrap();
    assert!(std::fs::read_to_string(&cfg)
        .unwrap()
        .starts_with("\nlabel kickstart\n"));
}
