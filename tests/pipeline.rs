use std::{
    fs::{create_dir_all, read_to_string, set_permissions, write, Permissions},
    io,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use ksiso::{
    error::{Error, Result},
    kickstart::KickstartValidator,
    mkisofs::{IsoPackager, IsoPackagerBuilder},
    mount::{prepare_mount_point, MountLock, MountSession, SourceMounter},
    pipeline::{Failure, Pipeline, PipelineConfig, PipelineConfigBuilder, Stage},
};
use tempfile::TempDir;

const KICKSTART: &str = "lang en_US.UTF-8
keyboard us
timezone UTC
rootpw --lock
autopart
reboot

%packages
@core
%end
";

const ISOLINUX_CFG: &str = "default vesamenu.c32
timeout 600

label linux
  menu label ^Install Fedora
  kernel vmlinuz
  append initrd=initrd.img inst.stage2=hd:LABEL=Fedora-S-dvd quiet

label check
  menu label Test this ^media & install Fedora
  menu default
  kernel vmlinuz
  append initrd=initrd.img inst.stage2=hd:LABEL=Fedora-S-dvd rd.live.check quiet
";

const FAKE_GENISOIMAGE: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "fake iso" > "$out"
"#;

const FAILING_GENISOIMAGE: &str = "#!/bin/sh
echo 'genisoimage: No space left on device' >&2
exit 1
";

/// Stands in for a loop mount: the mount point is prepared but the tree under it is
/// whatever the test put there
#[derive(Default)]
struct RecordingMounter {
    attaches: usize,
    releases: usize,
    attached: bool,
    fail_attach: bool,
    fail_release: bool,
}

impl SourceMounter for RecordingMounter {
    fn attach(&mut self, image: &Path, mount_point: &Path) -> Result<MountSession> {
        prepare_mount_point(image, mount_point)?;
        self.attaches += 1;
        if self.fail_attach {
            return Err(Error::Mount {
                image: image.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        self.attached = true;
        Ok(MountSession::attached(image, mount_point))
    }

    fn detach(&mut self, session: &MountSession) -> Result<()> {
        self.releases += 1;
        if self.fail_release {
            return Err(Error::Unmount {
                mount_point: session.mount_point().to_path_buf(),
                source: io::Error::from(io::ErrorKind::ResourceBusy),
            });
        }
        self.attached = false;
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Self { dir };

        let src = fixture.mount_point();
        create_dir_all(src.join("isolinux")).unwrap();
        create_dir_all(src.join("images/pxeboot")).unwrap();
        write(src.join("isolinux/isolinux.cfg"), ISOLINUX_CFG).unwrap();
        write(src.join("isolinux/isolinux.bin"), vec![0u8; 2048]).unwrap();
        write(src.join("isolinux/vmlinuz"), b"kernel").unwrap();
        write(src.join("isolinux/initrd.img"), b"initrd").unwrap();
        write(src.join("images/pxeboot/vmlinuz"), b"kernel").unwrap();
        symlink("../isolinux/vmlinuz", src.join("images/vmlinuz")).unwrap();
        // Files on an ISO are read only
        set_permissions(
            src.join("isolinux/isolinux.cfg"),
            Permissions::from_mode(0o444),
        )
        .unwrap();

        write(fixture.input(), b"not really an iso").unwrap();
        write(fixture.kickstart(), KICKSTART).unwrap();
        fixture.tool("genisoimage", FAKE_GENISOIMAGE);
        fixture.tool("failing-genisoimage", FAILING_GENISOIMAGE);

        fixture
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn tool(&self, name: &str, script: &str) -> PathBuf {
        let path = self.path().join(name);
        if !path.exists() {
            write(&path, script).unwrap();
            set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn mount_point(&self) -> PathBuf {
        self.path().join("src")
    }

    fn input(&self) -> PathBuf {
        self.path().join("base.iso")
    }

    fn kickstart(&self) -> PathBuf {
        self.path().join("auto.cfg")
    }

    fn output(&self) -> PathBuf {
        self.path().join("out")
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfigBuilder::default()
            .output(self.output())
            .kickstart(self.kickstart())
            .input(self.input())
            .mount_point(self.mount_point())
            .build()
            .unwrap()
    }

    fn packager(&self) -> IsoPackager {
        IsoPackagerBuilder::default()
            .program(self.tool("genisoimage", FAKE_GENISOIMAGE))
            .build()
            .unwrap()
    }

    fn pipeline(&self, mounter: RecordingMounter) -> Pipeline<RecordingMounter> {
        self.pipeline_with(self.config(), mounter, self.packager())
    }

    fn pipeline_with(
        &self,
        config: PipelineConfig,
        mounter: RecordingMounter,
        packager: IsoPackager,
    ) -> Pipeline<RecordingMounter> {
        Pipeline::new(config, KickstartValidator::builtin(), mounter, packager)
    }
}

fn expect_failure(result: std::result::Result<ksiso::pipeline::Success, Failure>) -> Failure {
    match result {
        Ok(success) => panic!("Expected a failure, got {}", success),
        Err(failure) => failure,
    }
}

#[test]
fn test_customizes_image() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline(RecordingMounter::default());

    let success = pipeline.run().unwrap();

    let working = fixture.output().join("working");
    assert_eq!(success.output_image, fixture.output().join("custom-base.iso"));
    assert_eq!(success.working_dir, working);
    assert_eq!(success.entry.label(), "kickstart");
    assert_eq!(success.report.files, 5);
    assert_eq!(success.report.symlinks, 1);

    assert_eq!(
        read_to_string(working.join("isolinux/auto.cfg")).unwrap(),
        KICKSTART
    );
    let cfg = read_to_string(working.join("isolinux/isolinux.cfg")).unwrap();
    assert!(cfg.starts_with(ISOLINUX_CFG));
    assert!(cfg.ends_with(
        "label kickstart
  menu label ^Install system with kickstart
  menu default
  kernel vmlinuz
  append initrd=initrd.img inst.ks=cdrom:/isolinux/auto.cfg quiet
"
    ));
    assert_eq!(
        std::fs::read_link(working.join("images/vmlinuz")).unwrap(),
        PathBuf::from("../isolinux/vmlinuz")
    );

    assert!(std::fs::metadata(&success.output_image).unwrap().len() > 0);

    let mounter = pipeline.mounter();
    assert_eq!((mounter.attaches, mounter.releases), (1, 1));
    assert!(!mounter.attached);
    assert!(!fixture.path().join(".src.lock").exists());

    // The source tree is untouched
    assert_eq!(
        read_to_string(fixture.mount_point().join("isolinux/isolinux.cfg")).unwrap(),
        ISOLINUX_CFG
    );
    assert!(!fixture.mount_point().join("isolinux/auto.cfg").exists());
}

#[test]
fn test_invalid_kickstart_never_mounts() {
    let fixture = Fixture::new();
    write(fixture.kickstart(), "lang en_US\n%packages\n@core\n").unwrap();
    std::fs::remove_dir_all(fixture.mount_point()).unwrap();

    let mut pipeline = fixture.pipeline(RecordingMounter::default());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Validate);
    assert!(matches!(failure.error, Error::Validation { .. }));
    assert!(failure.cleanup.is_none());
    assert_eq!(pipeline.mounter().attaches, 0);
    assert_eq!(pipeline.mounter().releases, 0);
    assert!(!fixture.mount_point().exists());
    assert!(!fixture.output().exists());
}

#[test]
fn test_kickstart_name_with_whitespace_never_mounts() {
    let fixture = Fixture::new();
    let kickstart = fixture.path().join("my auto.cfg");
    write(&kickstart, KICKSTART).unwrap();
    let config = PipelineConfigBuilder::default()
        .output(fixture.output())
        .kickstart(&kickstart)
        .input(fixture.input())
        .mount_point(fixture.mount_point())
        .build()
        .unwrap();

    let mut pipeline =
        fixture.pipeline_with(config, RecordingMounter::default(), fixture.packager());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Validate);
    assert!(matches!(failure.error, Error::Validation { .. }));
    assert_eq!(pipeline.mounter().attaches, 0);
    assert!(!fixture.output().exists());
}

#[test]
fn test_missing_input() {
    let fixture = Fixture::new();
    let mount_point = fixture.path().join("mnt/src");
    let config = PipelineConfigBuilder::default()
        .output(fixture.output())
        .kickstart(fixture.kickstart())
        .input(fixture.path().join("missing.iso"))
        .mount_point(&mount_point)
        .build()
        .unwrap();

    let mut pipeline =
        fixture.pipeline_with(config, RecordingMounter::default(), fixture.packager());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Mount);
    assert!(matches!(failure.error, Error::NotFound { .. }));
    assert_eq!(pipeline.mounter().attaches, 0);
    assert!(!mount_point.exists());
    assert!(!fixture.output().join("working").exists());
}

#[test]
fn test_attach_failure_is_not_released() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline(RecordingMounter {
        fail_attach: true,
        ..Default::default()
    });

    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Mount);
    assert!(matches!(failure.error, Error::Mount { .. }));
    assert!(failure.cleanup.is_none());
    assert_eq!(pipeline.mounter().releases, 0);
    assert!(!fixture.output().exists());
}

#[test]
fn test_staging_failure_still_unmounts() {
    let fixture = Fixture::new();
    create_dir_all(fixture.output().join("working")).unwrap();
    write(fixture.output().join("working/leftover"), b"from an earlier run").unwrap();

    let mut pipeline = fixture.pipeline(RecordingMounter::default());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Staging);
    assert!(matches!(failure.error, Error::Io { .. }));
    assert_eq!(pipeline.mounter().releases, 1);
    assert!(!pipeline.mounter().attached);
    assert!(!fixture.output().join("custom-base.iso").exists());
}

#[test]
fn test_packaging_failure_still_unmounts() {
    let fixture = Fixture::new();
    let packager = IsoPackagerBuilder::default()
        .program(fixture.tool("failing-genisoimage", FAILING_GENISOIMAGE))
        .build()
        .unwrap();
    let mut pipeline =
        fixture.pipeline_with(fixture.config(), RecordingMounter::default(), packager);

    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Package);
    match &failure.error {
        Error::Packaging { diagnostics, .. } => {
            assert_eq!(diagnostics, "genisoimage: No space left on device")
        }
        e => panic!("Unexpected error {}", e),
    }
    assert_eq!(pipeline.mounter().releases, 1);
    assert!(!fixture.output().join("custom-base.iso").exists());
    // The staged tree is kept for inspection
    assert!(fixture
        .output()
        .join("working/isolinux/auto.cfg")
        .exists());
}

#[test]
fn test_unmount_failure_does_not_hide_original_error() {
    let fixture = Fixture::new();
    let packager = IsoPackagerBuilder::default()
        .program(fixture.tool("failing-genisoimage", FAILING_GENISOIMAGE))
        .build()
        .unwrap();
    let mut pipeline = fixture.pipeline_with(
        fixture.config(),
        RecordingMounter {
            fail_release: true,
            ..Default::default()
        },
        packager,
    );

    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Package);
    assert!(matches!(failure.error, Error::Packaging { .. }));
    assert!(matches!(failure.cleanup, Some(Error::Unmount { .. })));
    assert_eq!(pipeline.mounter().releases, 1);
    assert!(failure.to_string().starts_with("Packaging the new image failed"));
}

#[test]
fn test_unmount_failure_after_success_fails_the_run() {
    let fixture = Fixture::new();
    let mut pipeline = fixture.pipeline(RecordingMounter {
        fail_release: true,
        ..Default::default()
    });

    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Release);
    assert!(matches!(failure.error, Error::Unmount { .. }));
    assert_eq!(pipeline.mounter().releases, 1);
}

#[test]
fn test_locked_mount_point() {
    let fixture = Fixture::new();
    let _lock = MountLock::acquire(&fixture.mount_point()).unwrap();

    let mut pipeline = fixture.pipeline(RecordingMounter::default());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Mount);
    assert!(matches!(failure.error, Error::Locked { .. }));
    assert_eq!(pipeline.mounter().attaches, 0);
}

#[test]
fn test_kickstart_name_clash() {
    let fixture = Fixture::new();
    let kickstart = fixture.path().join("isolinux.cfg");
    write(&kickstart, KICKSTART).unwrap();
    let config = PipelineConfigBuilder::default()
        .output(fixture.output())
        .kickstart(&kickstart)
        .input(fixture.input())
        .mount_point(fixture.mount_point())
        .build()
        .unwrap();

    let mut pipeline =
        fixture.pipeline_with(config, RecordingMounter::default(), fixture.packager());
    let failure = expect_failure(pipeline.run());

    assert_eq!(failure.stage, Stage::Patch);
    assert_eq!(pipeline.mounter().releases, 1);
    assert_eq!(
        read_to_string(fixture.output().join("working/isolinux/isolinux.cfg")).unwrap(),
        ISOLINUX_CFG
    );
}
