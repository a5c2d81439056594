//! Read-only attachment of the source image and guaranteed release of it

use std::{
    fs::{create_dir_all, metadata, remove_file, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use log::{debug, error, info, warn};
use loopdev::{LoopControl, LoopDevice};
use sys_mount::{unmount, Mount, MountFlags, SupportedFilesystems, Unmount, UnmountFlags};

use crate::error::{Error, Result};

/// The kernel objects behind a loop mount. Both must go on release.
#[derive(Debug)]
struct LoopMount {
    device: LoopDevice,
    mount: Mount,
}

/// An attachment of a source image to a mount point
#[derive(Debug)]
pub struct MountSession {
    image: PathBuf,
    mount_point: PathBuf,
    attached: bool,
    loop_mount: Option<LoopMount>,
}

impl MountSession {
    /// A session that has not (or not yet) been attached. Releasing it does nothing.
    pub fn detached(image: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            mount_point: mount_point.into(),
            attached: false,
            loop_mount: None,
        }
    }

    pub fn attached(image: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            attached: true,
            ..Self::detached(image, mount_point)
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

pub trait SourceMounter {
    /// Attach `image` read-only at `mount_point`, creating the mount point if needed
    fn attach(&mut self, image: &Path, mount_point: &Path) -> Result<MountSession>;

    /// Undo an attachment made by `attach`
    fn detach(&mut self, session: &MountSession) -> Result<()>;

    /// Release a session. Sessions that are not attached (never were, or were already
    /// released) are left alone and `Ok` is returned.
    fn release(&mut self, session: &mut MountSession) -> Result<()> {
        if !session.attached {
            debug!(
                "{} is not attached, nothing to release",
                session.mount_point.to_string_lossy()
            );
            return Ok(());
        }
        self.detach(session)?;
        session.attached = false;
        session.loop_mount = None;
        Ok(())
    }
}

/// Create the mount point and check the image exists, common to all mounters
pub fn prepare_mount_point(image: &Path, mount_point: &Path) -> Result<()> {
    if !image.is_file() {
        return Err(Error::not_found("Source image", image));
    }
    create_dir_all(mount_point).map_err(|e| Error::io(mount_point, e))
}

/// Loop mounts images with the kernel's filesystem autodetection
///
/// The loop device is set up here rather than by `sys-mount`, which only does so for
/// some file extensions and attaches it writable without autoclear.
#[derive(Default)]
pub struct LoopMounter;

impl LoopMounter {
    /// Bind `image` read-only to a free loop device that clears itself once unused
    fn loop_device(image: &Path) -> io::Result<(LoopDevice, PathBuf)> {
        let device = LoopControl::open()?.next_free()?;
        device.with().read_only(true).autoclear(true).attach(image)?;
        match device.path() {
            Some(path) => Ok((device, path)),
            None => {
                let _ = device.detach();
                Err(io::Error::new(ErrorKind::NotFound, "loop device has no path"))
            }
        }
    }
}

impl SourceMounter for LoopMounter {
    fn attach(&mut self, image: &Path, mount_point: &Path) -> Result<MountSession> {
        prepare_mount_point(image, mount_point)?;

        let mount_err = |source| Error::Mount {
            image: image.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            source,
        };

        let supported = SupportedFilesystems::new().map_err(mount_err)?;
        let (device, device_path) = Self::loop_device(image).map_err(mount_err)?;

        info!(
            "Mounting '{}' ({}) to '{}'",
            image.to_string_lossy(),
            device_path.to_string_lossy(),
            mount_point.to_string_lossy()
        );

        let mounted = Mount::new(
            &device_path,
            mount_point,
            &supported,
            MountFlags::RDONLY,
            None,
        );
        let mount = match mounted {
            Ok(mount) => mount,
            Err(e) => {
                if let Err(detach_err) = device.detach() {
                    warn!(
                        "Could not detach {}: {}",
                        device_path.to_string_lossy(),
                        detach_err
                    );
                }
                return Err(mount_err(e));
            }
        };

        Ok(MountSession {
            loop_mount: Some(LoopMount { device, mount }),
            ..MountSession::attached(image, mount_point)
        })
    }

    fn detach(&mut self, session: &MountSession) -> Result<()> {
        info!(
            "Unmounting '{}' from '{}'",
            session.image.to_string_lossy(),
            session.mount_point.to_string_lossy()
        );
        let unmount_err = |source| Error::Unmount {
            mount_point: session.mount_point.clone(),
            source,
        };

        match &session.loop_mount {
            Some(loop_mount) => {
                loop_mount
                    .mount
                    .unmount(UnmountFlags::DETACH)
                    .map_err(unmount_err)?;
                // With autoclear set the kernel defers this while the mount is still busy
                loop_mount.device.detach().map_err(unmount_err)
            }
            None => unmount(&session.mount_point, UnmountFlags::DETACH).map_err(unmount_err),
        }
    }
}

/// Owns an attached session and releases it exactly once, either through
/// [`MountGuard::release`] or when dropped
pub struct MountGuard<'a, M: SourceMounter> {
    mounter: &'a mut M,
    session: MountSession,
    released: bool,
}

impl<'a, M: SourceMounter> MountGuard<'a, M> {
    pub fn new(mounter: &'a mut M, session: MountSession) -> Self {
        Self {
            mounter,
            session,
            released: false,
        }
    }

    /// Attach through `mounter` and guard the resulting session
    pub fn attach(mounter: &'a mut M, image: &Path, mount_point: &Path) -> Result<Self> {
        let session = mounter.attach(image, mount_point)?;
        Ok(Self::new(mounter, session))
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.mounter.release(&mut self.session)
    }
}

impl<M: SourceMounter> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.mounter.release(&mut self.session) {
            error!("{}", e);
        }
    }
}

const LOCK_ATTEMPTS: usize = 3;

/// Exclusive advisory lock for a mount point, held until dropped
///
/// The lock file lives next to the mount point since anything inside it is hidden
/// once the image is mounted.
#[derive(Debug)]
pub struct MountLock {
    path: PathBuf,
    _file: File,
}

impl MountLock {
    pub fn lock_path(mount_point: &Path) -> PathBuf {
        let name = mount_point
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let parent = match mount_point.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => PathBuf::from("/"),
        };
        parent.join(format!(".{}.lock", name))
    }

    /// Take the lock or fail with [`Error::Locked`] if another job holds it
    pub fn acquire(mount_point: &Path) -> Result<Self> {
        let path = Self::lock_path(mount_point);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let locked = || Error::Locked {
            mount_point: mount_point.to_path_buf(),
        };

        for _ in 0..LOCK_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| Error::io(&path, e))?;
            FileExt::try_lock_exclusive(&file).map_err(|_| locked())?;

            // The previous holder may have removed the file between our open and lock
            let opened = file.metadata().map_err(|e| Error::io(&path, e))?;
            match metadata(&path) {
                Ok(current) if current.dev() == opened.dev() && current.ino() == opened.ino() => {
                    debug!("Locked {}", path.to_string_lossy());
                    return Ok(Self { path, _file: file });
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&path, e)),
            }
            debug!("{} was replaced while locking, retrying", path.to_string_lossy());
        }
        Err(locked())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountLock {
    fn drop(&mut self) {
        // Removed while still locked, so a waiting job locks a fresh file
        if let Err(e) = remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove {}: {}", self.path.to_string_lossy(), e);
            }
        }
    }
}

#[cfg(test)]
#[derive(Default)]
struct CountingMounter {
    attaches: usize,
    detaches: usize,
    fail_detach: bool,
}

#[cfg(test)]
impl SourceMounter for CountingMounter {
    fn attach(&mut self, image: &Path, mount_point: &Path) -> Result<MountSession> {
        prepare_mount_point(image, mount_point)?;
        self.attaches += 1;
        Ok(MountSession::attached(image, mount_point))
    }

    fn detach(&mut self, session: &MountSession) -> Result<()> {
        self.detaches += 1;
        if self.fail_detach {
            return Err(Error::Unmount {
                mount_point: session.mount_point().to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::ResourceBusy),
            });
        }
        Ok(())
    }
}

#[test]
fn test_release_without_attach_is_noop() {
    let mut session = MountSession::detached("/nonexistent/base.iso", "/nonexistent/mnt");

    // The real mounter would fail loudly if it tried to unmount anything here
    assert!(LoopMounter.release(&mut session).is_ok());
    assert!(!session.is_attached());
}

#[test]
fn test_release_is_idempotent() {
    let mut mounter = CountingMounter::default();
    let mut session = MountSession::attached("base.iso", "/mnt/src");

    mounter.release(&mut session).unwrap();
    mounter.release(&mut session).unwrap();

    assert_eq!(mounter.detaches, 1);
    assert!(!session.is_attached());
}

#[test]
fn test_attach_missing_image() {
    let dir = tempfile::tempdir().unwrap();
    let mount_point = dir.path().join("mnt");

    let err = LoopMounter
        .attach(&dir.path().join("base.iso"), &mount_point)
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }));
    assert!(!mount_point.exists());
}

#[test]
fn test_prepare_mount_point_existing() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("base.iso");
    std::fs::write(&image, b"iso").unwrap();

    prepare_mount_point(&image, &dir.path().join("mnt")).unwrap();
    prepare_mount_point(&image, &dir.path().join("mnt")).unwrap();
    assert!(dir.path().join("mnt").is_dir());
}

#[test]
fn test_guard_releases_once() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("base.iso");
    std::fs::write(&image, b"iso").unwrap();
    let mut mounter = CountingMounter::default();

    let guard = MountGuard::attach(&mut mounter, &image, &dir.path().join("mnt")).unwrap();
    assert!(guard.session().is_attached());
    guard.release().unwrap();
    assert_eq!((mounter.attaches, mounter.detaches), (1, 1));

    {
        let _guard = MountGuard::attach(&mut mounter, &image, &dir.path().join("mnt")).unwrap();
    }
    assert_eq!((mounter.attaches, mounter.detaches), (2, 2));
}

#[test]
fn test_guard_reports_release_failure() {
    let mut mounter = CountingMounter {
        fail_detach: true,
        ..Default::default()
    };

    let guard = MountGuard::new(&mut mounter, MountSession::attached("base.iso", "/mnt/src"));
    assert!(matches!(guard.release(), Err(Error::Unmount { .. })));
    // Released once already, dropping must not try again
    assert_eq!(mounter.detaches, 1);
}

#[test]
fn test_mount_lock_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let mount_point = dir.path().join("src");

    let lock = MountLock::acquire(&mount_point).unwrap();
    assert_eq!(lock.path(), dir.path().join(".src.lock"));
    assert!(!mount_point.exists());

    assert!(matches!(
        MountLock::acquire(&mount_point),
        Err(Error::Locked { .. })
    ));

    drop(lock);
    assert!(!dir.path().join(".src.lock").exists());
    assert!(MountLock::acquire(&mount_point).is_ok());
}

#[test]
fn test_mount_lock_survives_stale_file() {
    let dir = tempfile::tempdir().unwrap();
    let mount_point = dir.path().join("src");
    // Left behind by a job that was killed
    std::fs::write(dir.path().join(".src.lock"), "").unwrap();

    let lock = MountLock::acquire(&mount_point).unwrap();
    drop(lock);
    assert!(!dir.path().join(".src.lock").exists());
}

#[cfg(test)]
fn loop_devices_backing(image: &Path) -> Vec<String> {
    let image = std::fs::canonicalize(image).unwrap();
    std::fs::read_dir("/sys/block")
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("loop"))
        .filter(|e| {
            std::fs::read_to_string(e.path().join("loop/backing_file"))
                .map(|backing| Path::new(backing.trim()) == image)
                .unwrap_or(false)
        })
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect()
}

#[cfg(test)]
#[test_with::root()]
#[test_with::executable(genisoimage)]
#[test]
fn test_loop_mount_releases_loop_device() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("README"), "hello").unwrap();
    // No extension, the loop device must not depend on one
    let image = dir.path().join("source-image");
    let status = std::process::Command::new("genisoimage")
        .arg("-quiet")
        .arg("-o")
        .arg(&image)
        .arg(&tree)
        .status()
        .unwrap();
    assert!(status.success());

    let mount_point = dir.path().join("mnt");
    let mut mounter = LoopMounter;
    let guard = MountGuard::attach(&mut mounter, &image, &mount_point).unwrap();
    assert_eq!(
        std::fs::read_to_string(mount_point.join("README")).unwrap(),
        "hello"
    );
    assert_eq!(loop_devices_backing(&image).len(), 1);
    // Read-only all the way down
    assert!(std::fs::write(mount_point.join("new"), "x").is_err());
    guard.release().unwrap();

    assert!(!mount_point.join("README").exists());
    // Autoclear may finish shortly after the detach returns
    let mut remaining = loop_devices_backing(&image);
    for _ in 0..20 {
        if remaining.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        remaining = loop_devices_backing(&image);
    }
    assert!(remaining.is_empty(), "still bound: {:?}", remaining);
}

#[test]
fn test_lock_path() {
    assert_eq!(
        MountLock::lock_path(Path::new("/mnt/src")),
        PathBuf::from("/mnt/.src.lock")
    );
    assert_eq!(
        MountLock::lock_path(Path::new("mnt")),
        PathBuf::from("./.mnt.lock")
    );
}
