//! Wrapper around genisoimage/mkisofs for building isolinux-bootable ISOs

use std::{
    ffi::OsString,
    fs::{set_permissions, File, Permissions},
    io::{Read, Seek, SeekFrom},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use derive_builder::Builder;
use log::{debug, info};
use nix::sys::stat::{umask, Mode};
use tempfile::Builder as TempBuilder;

use crate::{
    check_command, command_output,
    error::{Error, Result},
};

/// ISO9660 volume identifiers are at most 32 characters
pub const VOLUME_ID_LEN: usize = 32;

const SECTOR_SIZE: u64 = 2048;
/// The primary volume descriptor is the first descriptor, at sector 16
const PVD_OFFSET: u64 = 16 * SECTOR_SIZE;
const VOLUME_ID_OFFSET: u64 = 40;

/// Read the volume identifier from the primary volume descriptor of an ISO9660 image.
/// `None` if the file is not an ISO9660 image or the identifier is blank.
pub fn read_volume_id(image: &Path) -> std::io::Result<Option<String>> {
    let mut file = File::open(image)?;
    let mut descriptor = [0u8; VOLUME_ID_OFFSET as usize + VOLUME_ID_LEN];
    file.seek(SeekFrom::Start(PVD_OFFSET))?;
    if let Err(e) = file.read_exact(&mut descriptor) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }

    // Type 1 is the primary volume descriptor
    if descriptor[0] != 1 || &descriptor[1..6] != b"CD001" {
        return Ok(None);
    }

    let id = String::from_utf8_lossy(&descriptor[VOLUME_ID_OFFSET as usize..])
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string();

    Ok(if id.is_empty() { None } else { Some(id) })
}

/// Mode of a file created the usual way, `0o666` without the bits of the umask
pub fn default_file_mode() -> u32 {
    // The umask can only be read by replacing it
    let mask = umask(Mode::empty());
    umask(mask);
    0o666 & !mask.bits()
}

/// Truncate a label to a valid volume identifier length
pub fn volume_label(label: &str) -> String {
    label.chars().take(VOLUME_ID_LEN).collect()
}

/// The volume label for a customized `image`: the source's own volume identifier, so
/// boot entries locating the media by label keep working, or "<stem> Custom".
pub fn label_for(image: &Path) -> String {
    match read_volume_id(image) {
        Ok(Some(id)) => {
            debug!("Reusing volume id '{}' of {}", id, image.to_string_lossy());
            volume_label(&id)
        }
        _ => {
            let stem = image
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "install".to_string());
            volume_label(&format!("{} Custom", stem))
        }
    }
}

/// Options for packaging an isolinux (El Torito, no emulation) bootable ISO. The boot
/// files must match the boot loader actually present in the staged tree.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), default)]
pub struct IsoPackager {
    /// genisoimage or a compatible mkisofs
    program: PathBuf,
    /// Boot image, relative to the staged tree
    boot_image: String,
    /// Boot catalog to generate, relative to the staged tree
    boot_catalog: String,
    /// Number of 512 byte sectors to load in no emulation mode
    boot_load_size: u32,
}

impl Default for IsoPackager {
    fn default() -> Self {
        Self {
            program: PathBuf::from("genisoimage"),
            boot_image: "isolinux/isolinux.bin".to_string(),
            boot_catalog: "isolinux/boot.cat".to_string(),
            boot_load_size: 4,
        }
    }
}

impl IsoPackager {
    /// Arguments for packaging `root` into `output`, passed to the tool as they are
    pub fn args(&self, root: &Path, output: &Path, label: &str) -> Vec<OsString> {
        let label = volume_label(label);
        let mut args: Vec<OsString> = [
            // Rock Ridge and Joliet names
            "-U",
            "-r",
            "-v",
            "-T",
            "-J",
            "-joliet-long",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        for flag in ["-V", "-volset", "-A"] {
            args.push(flag.into());
            args.push(label.clone().into());
        }

        args.push("-b".into());
        args.push(self.boot_image.clone().into());
        args.push("-c".into());
        args.push(self.boot_catalog.clone().into());
        args.push("-no-emul-boot".into());
        args.push("-boot-load-size".into());
        args.push(self.boot_load_size.to_string().into());
        args.push("-boot-info-table".into());
        args.push("-o".into());
        args.push(output.into());
        args.push(root.into());
        args
    }

    /// Package `root` into a bootable image at `output`. The image only appears at
    /// `output` once the tool succeeded.
    pub fn pack(&self, root: &Path, output: &Path, label: &str) -> Result<PathBuf> {
        let program = self.program.to_string_lossy().to_string();

        if !root.join(&self.boot_image).is_file() {
            return Err(Error::Packaging {
                program,
                reason: format!(
                    "boot image {} is missing from {}",
                    self.boot_image,
                    root.to_string_lossy()
                ),
                diagnostics: String::new(),
            });
        }

        let out_dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "custom.iso".to_string());

        // Written next to the final image so the rename stays on one filesystem
        let partial = TempBuilder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".partial")
            .tempfile_in(&out_dir)
            .map_err(|e| Error::io(&out_dir, e))?
            .into_temp_path();

        info!(
            "Packaging '{}' into '{}' (volume '{}')",
            root.to_string_lossy(),
            output.to_string_lossy(),
            volume_label(label)
        );

        let output_result = Command::new(&self.program)
            .args(self.args(root, &partial, label))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match output_result {
            Ok(out) => {
                let diagnostics = command_output(&out);
                check_command(Ok(out)).map_err(|e| Error::Packaging {
                    program: program.clone(),
                    reason: e.to_string(),
                    diagnostics,
                })?;
            }
            Err(e) => {
                return Err(Error::Packaging {
                    program,
                    reason: e.to_string(),
                    diagnostics: String::new(),
                })
            }
        }

        let size = partial.metadata().map_err(|e| Error::io(partial.to_path_buf(), e))?.len();
        if size == 0 {
            return Err(Error::Packaging {
                program,
                reason: "produced an empty image".to_string(),
                diagnostics: String::new(),
            });
        }

        // tempfile creates the file with mode 0600
        set_permissions(&partial, Permissions::from_mode(default_file_mode()))
            .map_err(|e| Error::io(partial.to_path_buf(), e))?;

        partial
            .persist(output)
            .map_err(|e| Error::io(output, e.error))?;

        info!("Wrote {} ({} bytes)", output.to_string_lossy(), size);

        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-genisoimage");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(test)]
fn staged_tree(dir: &Path) -> PathBuf {
    let root = dir.join("working");
    std::fs::create_dir_all(root.join("isolinux")).unwrap();
    std::fs::write(root.join("isolinux/isolinux.bin"), vec![0u8; 2048]).unwrap();
    std::fs::write(root.join("isolinux/isolinux.cfg"), "label linux\n").unwrap();
    root
}

#[cfg(test)]
const WRITE_OUTPUT: &str = r#"while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "fake iso" > "$out""#;

#[test]
fn test_args() {
    let args = IsoPackager::default().args(
        Path::new("/out/working"),
        Path::new("/out/custom-base.iso"),
        "Fedora-WS-Live-40",
    );

    assert_eq!(
        args,
        [
            "-U",
            "-r",
            "-v",
            "-T",
            "-J",
            "-joliet-long",
            "-V",
            "Fedora-WS-Live-40",
            "-volset",
            "Fedora-WS-Live-40",
            "-A",
            "Fedora-WS-Live-40",
            "-b",
            "isolinux/isolinux.bin",
            "-c",
            "isolinux/boot.cat",
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
            "-o",
            "/out/custom-base.iso",
            "/out/working",
        ]
        .iter()
        .map(OsString::from)
        .collect::<Vec<_>>()
    );
}

#[test]
fn test_label_with_spaces_is_one_argument() {
    let args = IsoPackager::default().args(Path::new("w"), Path::new("o.iso"), "Fedora Custom");
    let pos = args.iter().position(|a| a == "-V").unwrap();
    assert_eq!(args[pos + 1], "Fedora Custom");
}

#[test]
fn test_volume_label_truncates() {
    assert_eq!(volume_label(&"x".repeat(40)).len(), VOLUME_ID_LEN);
}

#[test]
fn test_read_volume_id() {
    let dir = tempfile::tempdir().unwrap();
    let iso = dir.path().join("base.iso");
    let mut data = vec![0u8; (PVD_OFFSET + SECTOR_SIZE) as usize];
    let pvd = PVD_OFFSET as usize;
    data[pvd] = 1;
    data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
    let id = format!("{:<32}", "Fedora-WS-Live-40");
    data[pvd + 40..pvd + 72].copy_from_slice(id.as_bytes());
    std::fs::write(&iso, data).unwrap();

    assert_eq!(
        read_volume_id(&iso).unwrap(),
        Some("Fedora-WS-Live-40".to_string())
    );
    assert_eq!(label_for(&iso), "Fedora-WS-Live-40");

    let plain = dir.path().join("plain.iso");
    std::fs::write(&plain, b"not an iso").unwrap();
    assert_eq!(read_volume_id(&plain).unwrap(), None);
    assert_eq!(label_for(&plain), "plain Custom");
}

#[test]
fn test_pack_writes_output() {
    let dir = tempfile::tempdir().unwrap();
    let root = staged_tree(dir.path());
    let output = dir.path().join("custom-base.iso");
    let packager = IsoPackagerBuilder::default()
        .program(fake_tool(dir.path(), WRITE_OUTPUT))
        .build()
        .unwrap();

    assert_eq!(packager.pack(&root, &output, "base Custom").unwrap(), output);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "fake iso\n");
    assert_eq!(
        std::fs::metadata(&output).unwrap().permissions().mode() & 0o777,
        default_file_mode()
    );

    // Nothing but the tool, the tree and the image is left behind
    let mut names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["custom-base.iso", "fake-genisoimage", "working"]);
}

#[test]
fn test_pack_failure_carries_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let root = staged_tree(dir.path());
    let output = dir.path().join("custom-base.iso");
    let packager = IsoPackagerBuilder::default()
        .program(fake_tool(
            dir.path(),
            "echo 'genisoimage: Uh oh, I cant find the boot catalog' >&2\nexit 3",
        ))
        .build()
        .unwrap();

    match packager.pack(&root, &output, "base Custom").unwrap_err() {
        Error::Packaging {
            reason,
            diagnostics,
            ..
        } => {
            assert!(reason.contains("exit status: 3"));
            assert_eq!(diagnostics, "genisoimage: Uh oh, I cant find the boot catalog");
        }
        e => panic!("Unexpected error {}", e),
    }
    assert!(!output.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}

#[test]
fn test_pack_requires_boot_image() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("working");
    std::fs::create_dir_all(&root).unwrap();

    let err = IsoPackager::default()
        .pack(&root, &dir.path().join("custom-base.iso"), "base Custom")
        .unwrap_err();
    assert!(matches!(err, Error::Packaging { .. }));
}

#[cfg(test)]
#[test_with::executable(genisoimage)]
#[test]
fn test_pack_with_genisoimage() {
    let dir = tempfile::tempdir().unwrap();
    let root = staged_tree(dir.path());
    let output = dir.path().join("custom-base.iso");

    IsoPackager::default()
        .pack(&root, &output, "base Custom")
        .unwrap();

    assert!(std::fs::metadata(&output).unwrap().len() > 0);
    assert_eq!(read_volume_id(&output).unwrap(), Some("base Custom".to_string()));
}

#[test]
fn test_default_file_mode() {
    let mode = default_file_mode();
    assert_eq!(mode & !0o666, 0);
    // Owner read and write survive any sane umask
    assert_eq!(mode & 0o600, 0o600);
}
