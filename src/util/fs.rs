use std::{
    fs::{copy, create_dir_all, read_dir, read_link, set_permissions, symlink_metadata, Metadata},
    io::{self, ErrorKind},
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::Path,
};

use log::{debug, info};
use nix::sys::{
    stat::{utimensat, UtimensatFlags},
    time::TimeSpec,
};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Counts of what [`copy_dir`] reproduced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Copy access and modification times from `metadata` onto `path` without following
/// a symlink at `path`
pub fn copy_times(metadata: &Metadata, path: &Path) -> io::Result<()> {
    let atime = TimeSpec::new(metadata.atime(), metadata.atime_nsec());
    let mtime = TimeSpec::new(metadata.mtime(), metadata.mtime_nsec());
    utimensat(
        None,
        path,
        &atime,
        &mtime,
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Add the owner write bit to `path`. Trees copied out of an ISO are read only.
pub fn make_writable(path: &Path) -> io::Result<()> {
    let mut perms = symlink_metadata(path)?.permissions();
    if perms.mode() & 0o200 == 0 {
        perms.set_mode(perms.mode() | 0o200);
        set_permissions(path, perms)?;
    }
    Ok(())
}

/// Copy a single file with its permissions and timestamps
pub fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    let metadata = symlink_metadata(src).map_err(|e| Error::io(src, e))?;
    let bytes = copy(src, dest).map_err(|e| Error::io(dest, e))?;
    copy_times(&metadata, dest).map_err(|e| Error::io(dest, e))?;
    Ok(bytes)
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(read_dir(path)?.next().is_none())
}

/// Copy all files, directories and symlinks in a directory to another directory
///
/// Symlinks are recreated, never followed. Files keep their permissions and
/// timestamps, directories keep theirs plus the owner write bit so the copy can be
/// modified. `dest` is created if needed and must otherwise be empty. The first entry
/// that fails to copy aborts the whole copy.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<CopyReport> {
    if !src.is_dir() {
        return Err(Error::not_found("Source directory", src));
    }
    create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    if !is_empty_dir(dest).map_err(|e| Error::io(dest, e))? {
        return Err(Error::io(
            dest,
            io::Error::new(ErrorKind::AlreadyExists, "staging directory is not empty"),
        ));
    }

    info!(
        "Copying '{}' to '{}'",
        src.to_string_lossy(),
        dest.to_string_lossy()
    );

    let mut report = CopyReport::default();

    // Children come before their parent so directory metadata is applied last
    for entry in WalkDir::new(src).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(path, e.into())
        })?;
        if entry.depth() == 0 {
            continue;
        }

        let path = entry.path();
        let rel = path
            .strip_prefix(src)
            .map_err(|e| Error::io(path, io::Error::new(ErrorKind::InvalidInput, e)))?;
        let dest_path = dest.join(rel);
        let metadata = entry.metadata().map_err(|e| Error::io(path, e.into()))?;
        let file_type = entry.file_type();

        if let Some(parent) = dest_path.parent() {
            create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        if file_type.is_symlink() {
            let target = read_link(path).map_err(|e| Error::io(path, e))?;
            debug!(
                "Linking {} -> {}",
                dest_path.to_string_lossy(),
                target.to_string_lossy()
            );
            symlink(&target, &dest_path).map_err(|e| Error::io(&dest_path, e))?;
            copy_times(&metadata, &dest_path).map_err(|e| Error::io(&dest_path, e))?;
            report.symlinks += 1;
        } else if file_type.is_dir() {
            create_dir_all(&dest_path).map_err(|e| Error::io(&dest_path, e))?;
            let mut perms = metadata.permissions();
            perms.set_mode(perms.mode() | 0o200);
            set_permissions(&dest_path, perms).map_err(|e| Error::io(&dest_path, e))?;
            copy_times(&metadata, &dest_path).map_err(|e| Error::io(&dest_path, e))?;
            report.dirs += 1;
        } else if file_type.is_file() {
            debug!("Copying {}", rel.to_string_lossy());
            report.bytes += copy_file(path, &dest_path)?;
            report.files += 1;
        } else {
            return Err(Error::io(
                path,
                io::Error::new(ErrorKind::Unsupported, "not a file, directory or symlink"),
            ));
        }
    }

    info!(
        "Copied {} files, {} directories and {} symlinks ({} bytes)",
        report.files, report.dirs, report.symlinks, report.bytes
    );

    Ok(report)
}

#[test]
fn test_copy_dir_preserves_entries() {
    use std::{
        fs::{create_dir, set_permissions, write, Permissions},
        time::{Duration, SystemTime},
    };

    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let staged = dest.path().join("working");

    create_dir(src.path().join("isolinux")).unwrap();
    write(src.path().join("isolinux/isolinux.cfg"), "default vesamenu.c32\n").unwrap();
    set_permissions(
        src.path().join("isolinux/isolinux.cfg"),
        Permissions::from_mode(0o640),
    )
    .unwrap();
    write(src.path().join("README"), "hello").unwrap();
    symlink("isolinux/isolinux.cfg", src.path().join("cfg-link")).unwrap();
    // Dangling links are copied as they are
    symlink("does/not/exist", src.path().join("isolinux/dangling")).unwrap();

    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    std::fs::File::options()
        .write(true)
        .open(src.path().join("README"))
        .unwrap()
        .set_modified(when)
        .unwrap();

    let report = copy_dir(src.path(), &staged).unwrap();
    assert_eq!(
        report,
        CopyReport {
            files: 2,
            dirs: 1,
            symlinks: 2,
            bytes: 26,
        }
    );

    assert_eq!(
        std::fs::read_to_string(staged.join("isolinux/isolinux.cfg")).unwrap(),
        "default vesamenu.c32\n"
    );
    assert_eq!(
        std::fs::metadata(staged.join("isolinux/isolinux.cfg"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777,
        0o640
    );
    assert_eq!(
        std::fs::metadata(staged.join("README"))
            .unwrap()
            .modified()
            .unwrap(),
        when
    );

    let link = staged.join("cfg-link");
    assert!(symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(
        read_link(&link).unwrap(),
        Path::new("isolinux/isolinux.cfg")
    );
    assert_eq!(
        read_link(staged.join("isolinux/dangling")).unwrap(),
        Path::new("does/not/exist")
    );
}

#[test]
fn test_copy_dir_refuses_non_empty_dest() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("file"), "new").unwrap();
    std::fs::write(dest.path().join("file"), "old").unwrap();

    let err = copy_dir(src.path(), dest.path()).unwrap_err();
    match err {
        Error::Io { source, .. } => assert_eq!(source.kind(), ErrorKind::AlreadyExists),
        e => panic!("Unexpected error {}", e),
    }
    assert_eq!(
        std::fs::read_to_string(dest.path().join("file")).unwrap(),
        "old"
    );
}

#[test]
fn test_copy_dir_keeps_read_only_dirs_writable() {
    use std::fs::{create_dir, set_permissions, write, Permissions};

    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    create_dir(src.path().join("ro")).unwrap();
    write(src.path().join("ro/file"), "x").unwrap();
    set_permissions(src.path().join("ro"), Permissions::from_mode(0o555)).unwrap();

    copy_dir(src.path(), &dest.path().join("working")).unwrap();
    // Restore so the temporary directory can be cleaned up
    set_permissions(src.path().join("ro"), Permissions::from_mode(0o755)).unwrap();

    let mode = std::fs::metadata(dest.path().join("working/ro"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn test_make_writable() {
    use std::fs::{set_permissions, write, Permissions};

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("isolinux.cfg");
    write(&file, "").unwrap();
    set_permissions(&file, Permissions::from_mode(0o444)).unwrap();

    make_writable(&file).unwrap();
    assert_eq!(
        std::fs::metadata(&file).unwrap().permissions().mode() & 0o777,
        0o644
    );
}

#[test]
fn test_copy_dir_missing_source() {
    let dest = tempfile::tempdir().unwrap();
    assert!(matches!(
        copy_dir(&dest.path().join("nope"), &dest.path().join("working")),
        Err(Error::NotFound { .. })
    ));
}
