//! Kickstart file validation
//!
//! A kickstart file is checked with a built-in structural parser and, when pykickstart's
//! `ksvalidator` is installed, with the real grammar as well. The built-in parser only
//! knows a snapshot of the command set, so names it does not know are left to the oracle
//! and only warned about without one. Validation never touches anything but the
//! kickstart file itself.

use std::{
    fmt::{self, Display, Formatter},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::{debug, info, warn};
use which::which;

use crate::{
    check_command, command_output,
    error::{Error, Result},
};

/// pykickstart's grammar oracle
pub const KSVALIDATOR: &str = "ksvalidator";

/// Commands known to the built-in parser
const COMMANDS: &[&str] = &[
    "auth",
    "authconfig",
    "authselect",
    "autopart",
    "autostep",
    "bootloader",
    "btrfs",
    "cdrom",
    "clearpart",
    "cmdline",
    "device",
    "deviceprobe",
    "dmraid",
    "driverdisk",
    "eula",
    "fcoe",
    "firewall",
    "firstboot",
    "graphical",
    "group",
    "halt",
    "harddrive",
    "hmc",
    "ignoredisk",
    "install",
    "interactive",
    "iscsi",
    "iscsiname",
    "keyboard",
    "lang",
    "liveimg",
    "logging",
    "logvol",
    "mediacheck",
    "method",
    "module",
    "monitor",
    "mount",
    "multipath",
    "network",
    "nfs",
    "nvdimm",
    "ostreecontainer",
    "ostreesetup",
    "part",
    "partition",
    "poweroff",
    "raid",
    "realm",
    "reboot",
    "repo",
    "reqpart",
    "rescue",
    "rhsm",
    "rootpw",
    "selinux",
    "services",
    "shutdown",
    "skipx",
    "snapshot",
    "sshkey",
    "sshpw",
    "syspurpose",
    "text",
    "timesource",
    "timezone",
    "updates",
    "upgrade",
    "url",
    "user",
    "vnc",
    "volgroup",
    "xconfig",
    "zerombr",
    "zfcp",
    "zipl",
];

/// Known section headers. Every section, known or not, must be closed with `%end`.
const SECTIONS: &[&str] = &[
    "%packages",
    "%pre",
    "%pre-install",
    "%post",
    "%onerror",
    "%traceback",
    "%addon",
    "%anaconda",
];

/// Directives pulling in other files at install time
const INCLUDES: &[&str] = &["%include", "%ksappend"];

const SECTION_END: &str = "%end";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Header without arguments, e.g. `%post`
    pub name: String,
    /// 1-based line number of the header
    pub line: usize,
}

/// A command or section name missing from the built-in tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unknown {
    pub name: String,
    pub line: usize,
}

impl Display for Unknown {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.name)
    }
}

/// Summary of a kickstart file that passed validation
#[derive(Debug, Clone)]
pub struct Kickstart {
    pub path: PathBuf,
    pub commands: Vec<String>,
    pub sections: Vec<Section>,
    pub includes: Vec<String>,
    pub unknown: Vec<Unknown>,
}

impl Kickstart {
    /// The file name the kickstart will have once injected into the image
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Parse the structure of a kickstart file. The error is a human readable reason naming
/// the offending line. Unknown command and section names are not errors, they are
/// collected in [`Kickstart::unknown`].
pub fn parse(path: &Path, text: &str) -> std::result::Result<Kickstart, String> {
    let mut commands = Vec::new();
    let mut sections = Vec::new();
    let mut includes = Vec::new();
    let mut unknown = Vec::new();
    let mut open: Option<Section> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        let keyword = line.split_whitespace().next().unwrap_or("");

        if let Some(section) = &open {
            if keyword == SECTION_END {
                debug!("Closed {} from line {} at line {}", section.name, section.line, lineno);
                open = None;
            } else if SECTIONS.contains(&keyword) {
                return Err(format!(
                    "line {}: {} starts before {} from line {} ends with {}",
                    lineno, keyword, section.name, section.line, SECTION_END
                ));
            }
            continue;
        }

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if INCLUDES.contains(&keyword) {
            let target = line
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| format!("line {}: {} requires a path", lineno, keyword))?;
            warn!(
                "{} {} at line {} will only be resolved at install time",
                keyword, target, lineno
            );
            includes.push(target.to_string());
        } else if keyword == SECTION_END {
            return Err(format!("line {}: {} outside of a section", lineno, SECTION_END));
        } else if keyword.starts_with('%') {
            if !SECTIONS.contains(&keyword) {
                unknown.push(Unknown {
                    name: keyword.to_string(),
                    line: lineno,
                });
            }
            if keyword == "%addon" && line.split_whitespace().nth(1).is_none() {
                return Err(format!("line {}: %addon requires an addon name", lineno));
            }
            let section = Section {
                name: keyword.to_string(),
                line: lineno,
            };
            sections.push(section.clone());
            open = Some(section);
        } else {
            if !COMMANDS.contains(&keyword) {
                unknown.push(Unknown {
                    name: keyword.to_string(),
                    line: lineno,
                });
            }
            commands.push(keyword.to_string());
        }
    }

    if let Some(section) = open {
        return Err(format!(
            "{} at line {} does not end with {}",
            section.name, section.line, SECTION_END
        ));
    }

    if commands.is_empty() && includes.is_empty() {
        return Err("no kickstart commands found".to_string());
    }

    Ok(Kickstart {
        path: path.to_path_buf(),
        commands,
        sections,
        includes,
        unknown,
    })
}

/// Checks on the file name itself, which ends up on the kernel command line
fn check_file_name(path: &Path) -> Result<()> {
    let invalid = |reason: &str| Error::Validation {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let name = path
        .file_name()
        .ok_or_else(|| invalid("kickstart path has no file name"))?
        .to_str()
        .ok_or_else(|| invalid("file name is not valid UTF-8"))?;
    if name.chars().any(char::is_whitespace) {
        return Err(invalid(
            "file name contains whitespace, which would split the kernel command line",
        ));
    }
    Ok(())
}

pub struct KickstartValidator {
    oracle: Option<PathBuf>,
}

impl KickstartValidator {
    /// Validate with the built-in parser and `ksvalidator` if it is installed
    pub fn detect() -> Self {
        let oracle = which(KSVALIDATOR).ok();
        match &oracle {
            Some(path) => info!("Using {} for kickstart validation", path.to_string_lossy()),
            None => warn!(
                "{} not found, kickstart files get a structural check only",
                KSVALIDATOR
            ),
        }
        Self { oracle }
    }

    /// Validate with the built-in parser only
    pub fn builtin() -> Self {
        Self { oracle: None }
    }

    /// Validate with the built-in parser and an explicit grammar oracle
    pub fn with_oracle(oracle: impl Into<PathBuf>) -> Self {
        Self {
            oracle: Some(oracle.into()),
        }
    }

    pub fn validate(&self, path: &Path) -> Result<Kickstart> {
        if !path.is_file() {
            return Err(Error::not_found("Kickstart file", path));
        }
        check_file_name(path)?;

        let text = read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::InvalidData => Error::Validation {
                path: path.to_path_buf(),
                reason: "not valid UTF-8".to_string(),
            },
            _ => Error::io(path, e),
        })?;

        let kickstart = parse(path, &text).map_err(|reason| Error::Validation {
            path: path.to_path_buf(),
            reason,
        })?;

        if let Some(oracle) = &self.oracle {
            if !kickstart.unknown.is_empty() {
                debug!("Leaving {} unknown names to the oracle", kickstart.unknown.len());
            }
            debug!("Running {} on {}", oracle.to_string_lossy(), path.to_string_lossy());
            let output = Command::new(oracle)
                .arg(path)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(|e| Error::io(oracle, e))?;
            let diagnostics = command_output(&output);
            check_command(Ok(output)).map_err(|e| Error::Validation {
                path: path.to_path_buf(),
                reason: if diagnostics.is_empty() {
                    e.to_string()
                } else {
                    diagnostics
                },
            })?;
        } else {
            for name in &kickstart.unknown {
                warn!(
                    "{}: {} is not a known kickstart command or section",
                    path.to_string_lossy(),
                    name
                );
            }
        }

        info!(
            "Kickstart {} is valid ({} commands, {} sections)",
            path.to_string_lossy(),
            kickstart.commands.len(),
            kickstart.sections.len()
        );

        Ok(kickstart)
    }
}

#[cfg(test)]
const MINIMAL: &str = r#"# Minimal unattended install
lang en_US.UTF-8
keyboard us
timezone UTC
rootpw --lock
autopart
reboot

%packages
@core
-dracut-config-rescue
%end

%post --log=/root/ks-post.log
echo "%packages is just text here"
%end
"#;

#[test]
fn test_parse_minimal() {
    let ks = parse(Path::new("auto.cfg"), MINIMAL).unwrap();

    assert_eq!(
        ks.commands,
        vec!["lang", "keyboard", "timezone", "rootpw", "autopart", "reboot"]
    );
    assert_eq!(
        ks.sections,
        vec![
            Section {
                name: "%packages".to_string(),
                line: 9
            },
            Section {
                name: "%post".to_string(),
                line: 14
            },
        ]
    );
    assert_eq!(ks.file_name(), Some("auto.cfg"));
}

#[test]
fn test_parse_unterminated_section() {
    let err = parse(Path::new("ks.cfg"), "lang en_US\n%packages\n@core\n").unwrap_err();
    assert_eq!(err, "%packages at line 2 does not end with %end");
}

#[test]
fn test_parse_nested_section() {
    let err = parse(
        Path::new("ks.cfg"),
        "lang en_US\n%pre\necho hi\n%post\n%end\n",
    )
    .unwrap_err();
    assert!(err.starts_with("line 4: %post starts before %pre"));
}

#[test]
fn test_parse_collects_unknown_names() {
    let ks = parse(
        Path::new("ks.cfg"),
        "lang en_US\nbootc --source-imgref=registry:quay.io/fedora/fedora-bootc:41\n\
         %certificate --filename=rh.pem --dir=/etc/pki\n-----BEGIN CERTIFICATE-----\n%end\n",
    )
    .unwrap();

    assert_eq!(ks.commands, vec!["lang", "bootc"]);
    assert_eq!(ks.sections.len(), 1);
    assert_eq!(
        ks.unknown,
        vec![
            Unknown {
                name: "bootc".to_string(),
                line: 2
            },
            Unknown {
                name: "%certificate".to_string(),
                line: 3
            },
        ]
    );
    assert_eq!(ks.unknown[0].to_string(), "line 2: bootc");
}

#[test]
fn test_parse_unknown_section_needs_end() {
    let err = parse(Path::new("ks.cfg"), "lang en_US\n%certificate\ndata\n").unwrap_err();
    assert_eq!(err, "%certificate at line 2 does not end with %end");
}

#[test]
fn test_parse_rejects_stray_end() {
    assert_eq!(
        parse(Path::new("ks.cfg"), "lang en_US\n%end\n").unwrap_err(),
        "line 2: %end outside of a section"
    );
}

#[test]
fn test_parse_empty() {
    assert!(parse(Path::new("ks.cfg"), "# nothing\n\n").is_err());
}

#[test]
fn test_parse_include_only() {
    let ks = parse(Path::new("ks.cfg"), "%include /tmp/part-include\n").unwrap();
    assert_eq!(ks.includes, vec!["/tmp/part-include"]);
}

#[test]
fn test_validate_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = KickstartValidator::builtin()
        .validate(&dir.path().join("missing.cfg"))
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_validate_file() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.cfg");
    let bad = dir.path().join("bad.cfg");
    std::fs::write(&good, MINIMAL).unwrap();
    std::fs::write(&bad, "lang en_US\n%packages\n").unwrap();

    let validator = KickstartValidator::builtin();
    assert_eq!(validator.validate(&good).unwrap().path, good);
    assert!(matches!(
        validator.validate(&bad).unwrap_err(),
        Error::Validation { .. }
    ));
}

#[test]
fn test_validate_oracle_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let ks = dir.path().join("good.cfg");
    std::fs::write(&ks, MINIMAL).unwrap();

    // `false` stands in for a grammar oracle that rejects everything
    let err = KickstartValidator::with_oracle("false")
        .validate(&ks)
        .unwrap_err();
    match err {
        Error::Validation { reason, .. } => assert!(reason.contains("exit status: 1")),
        e => panic!("Unexpected error {}", e),
    }

    assert!(KickstartValidator::with_oracle("true").validate(&ks).is_ok());
}

#[test]
fn test_validate_unknown_command() {
    let dir = tempfile::tempdir().unwrap();
    let ks = dir.path().join("bootc.cfg");
    std::fs::write(
        &ks,
        "text\nbootc --source-imgref=registry:quay.io/fedora/fedora-bootc:41\nreboot\n",
    )
    .unwrap();

    let checked = KickstartValidator::with_oracle("true").validate(&ks).unwrap();
    assert_eq!(checked.unknown.len(), 1);
    // Without an oracle unknown names are only warned about
    assert!(KickstartValidator::builtin().validate(&ks).is_ok());
}

#[test]
fn test_validate_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let spaced = dir.path().join("my ks.cfg");
    std::fs::write(&spaced, MINIMAL).unwrap();

    match KickstartValidator::builtin().validate(&spaced).unwrap_err() {
        Error::Validation { reason, .. } => assert!(reason.contains("whitespace")),
        e => panic!("Unexpected error {}", e),
    }
}

#[test]
fn test_validate_non_utf8_file_name() {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let dir = tempfile::tempdir().unwrap();
    let ks = dir.path().join(OsStr::from_bytes(b"ks-\xff.cfg"));
    std::fs::write(&ks, MINIMAL).unwrap();

    match KickstartValidator::builtin().validate(&ks).unwrap_err() {
        Error::Validation { reason, .. } => assert_eq!(reason, "file name is not valid UTF-8"),
        e => panic!("Unexpected error {}", e),
    }
}
