//! The customization pipeline: validate, mount, stage, patch, package, and always
//! unmount.

use std::{
    fmt::{self, Display, Formatter},
    fs::create_dir_all,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use derive_builder::Builder;
use log::{debug, info, warn};

use crate::{
    error::Error,
    isolinux::{effective_default, patch, BootEntry, ISOLINUX_CFG, ISOLINUX_DIR},
    kickstart::{Kickstart, KickstartValidator},
    mkisofs::{label_for, IsoPackager},
    mount::{MountGuard, MountLock, SourceMounter},
    util::fs::{copy_dir, copy_file, make_writable, CopyReport},
};

pub const WORKING_DIR: &str = "working";

#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct PipelineConfig {
    /// Base directory for the staged tree and the final image
    output: PathBuf,
    /// Kickstart file to inject
    kickstart: PathBuf,
    /// Source ISO
    input: PathBuf,
    /// Where to mount the source ISO
    mount_point: PathBuf,
    /// Volume label of the new image, see [`label_for`] for the default
    #[builder(default, setter(into, strip_option))]
    volume_label: Option<String>,
}

impl PipelineConfig {
    pub fn working_dir(&self) -> PathBuf {
        self.output.join(WORKING_DIR)
    }

    pub fn isolinux_dir(&self) -> PathBuf {
        self.working_dir().join(ISOLINUX_DIR)
    }

    /// `<output>/custom-<input stem>.iso`
    pub fn output_image(&self) -> PathBuf {
        let stem = self
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "install".to_string());
        self.output.join(format!("custom-{}.iso", stem))
    }

    pub fn volume_label(&self) -> String {
        match &self.volume_label {
            Some(label) => label.clone(),
            None => label_for(&self.input),
        }
    }
}

/// The step a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Mount,
    Staging,
    Patch,
    Package,
    Release,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Stage::Validate => "Kickstart validation",
                Stage::Mount => "Mounting the source image",
                Stage::Staging => "Copying the source image",
                Stage::Patch => "Injecting the kickstart",
                Stage::Package => "Packaging the new image",
                Stage::Release => "Unmounting the source image",
            }
        )
    }
}

/// Progress of a run, only ever moving forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Start,
    Validated,
    Mounted,
    Staged,
    Patched,
    Packaged,
    Done,
}

fn advance(state: &mut State, next: State) {
    debug_assert!(next > *state);
    debug!("{:?} -> {:?}", state, next);
    *state = next;
}

#[derive(Debug)]
pub struct Success {
    pub output_image: PathBuf,
    pub working_dir: PathBuf,
    pub report: CopyReport,
    pub entry: BootEntry,
}

impl Display for Success {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Custom ISO created successfully: {}",
            self.output_image.to_string_lossy()
        )
    }
}

/// The first error of a failed run, plus the unmount error if releasing the source
/// image failed as well
#[derive(Debug)]
pub struct Failure {
    pub stage: Stage,
    pub state: State,
    pub error: Error,
    pub cleanup: Option<Error>,
}

impl Failure {
    fn new(stage: Stage, state: State, error: Error) -> Self {
        Self {
            stage,
            state,
            error,
            cleanup: None,
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)?;
        if let Some(cleanup) = &self.cleanup {
            write!(f, "\nAdditionally, unmounting failed: {}", cleanup)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub struct Pipeline<M: SourceMounter> {
    config: PipelineConfig,
    validator: KickstartValidator,
    mounter: M,
    packager: IsoPackager,
}

impl<M: SourceMounter> Pipeline<M> {
    pub fn new(
        config: PipelineConfig,
        validator: KickstartValidator,
        mounter: M,
        packager: IsoPackager,
    ) -> Self {
        Self {
            config,
            validator,
            mounter,
            packager,
        }
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Run every stage in order, stopping at the first failure. Once the source image
    /// is mounted it is unmounted again before returning, whatever happened.
    pub fn run(&mut self) -> Result<Success, Failure> {
        let mut state = State::Start;
        let config = &self.config;

        let kickstart = self
            .validator
            .validate(&config.kickstart)
            .map_err(|e| Failure::new(Stage::Validate, state, e))?;
        advance(&mut state, State::Validated);

        if !config.input.is_file() {
            return Err(Failure::new(
                Stage::Mount,
                state,
                Error::not_found("Source image", &config.input),
            ));
        }

        let _lock = MountLock::acquire(&config.mount_point)
            .map_err(|e| Failure::new(Stage::Mount, state, e))?;

        let guard = MountGuard::attach(&mut self.mounter, &config.input, &config.mount_point)
            .map_err(|e| Failure::new(Stage::Mount, state, e))?;
        advance(&mut state, State::Mounted);

        let result = customize(
            config,
            &kickstart,
            &self.packager,
            guard.session().mount_point(),
            &mut state,
        );

        let cleanup = guard.release().err();

        match (result, cleanup) {
            (Ok(success), None) => {
                advance(&mut state, State::Done);
                Ok(success)
            }
            (Ok(_), Some(e)) => Err(Failure::new(Stage::Release, state, e)),
            (Err((stage, error)), cleanup) => Err(Failure {
                stage,
                state,
                error,
                cleanup,
            }),
        }
    }
}

/// Everything that happens while the source image is mounted
fn customize(
    config: &PipelineConfig,
    kickstart: &Kickstart,
    packager: &IsoPackager,
    source: &Path,
    state: &mut State,
) -> Result<Success, (Stage, Error)> {
    let working_dir = config.working_dir();

    let report = copy_dir(source, &working_dir).map_err(|e| (Stage::Staging, e))?;
    advance(state, State::Staged);

    let entry = inject(config, kickstart).map_err(|e| (Stage::Patch, e))?;
    advance(state, State::Patched);

    let output_image = packager
        .pack(&working_dir, &config.output_image(), &config.volume_label())
        .map_err(|e| (Stage::Package, e))?;
    advance(state, State::Packaged);

    Ok(Success {
        output_image,
        working_dir,
        report,
        entry,
    })
}

/// Copy the kickstart into the staged isolinux directory and add a boot entry for it
fn inject(config: &PipelineConfig, kickstart: &Kickstart) -> Result<BootEntry, Error> {
    let isolinux_dir = config.isolinux_dir();
    if !isolinux_dir.is_dir() {
        warn!(
            "{} has no {} directory, creating it",
            config.input.to_string_lossy(),
            ISOLINUX_DIR
        );
        create_dir_all(&isolinux_dir).map_err(|e| Error::io(&isolinux_dir, e))?;
    }
    make_writable(&isolinux_dir).map_err(|e| Error::io(&isolinux_dir, e))?;

    let name = kickstart.file_name().ok_or_else(|| Error::Validation {
        path: kickstart.path.clone(),
        reason: "kickstart path has no usable file name".to_string(),
    })?;
    let dest = isolinux_dir.join(name);
    // Never clobber a file of the boot loader itself
    if dest.symlink_metadata().is_ok() {
        return Err(Error::io(
            &dest,
            io::Error::new(
                ErrorKind::AlreadyExists,
                "the staged image already has a file with the kickstart's name",
            ),
        ));
    }
    copy_file(&kickstart.path, &dest)?;
    info!(
        "Injected {} as {}",
        kickstart.path.to_string_lossy(),
        dest.to_string_lossy()
    );

    let cfg_path = isolinux_dir.join(ISOLINUX_CFG);
    if cfg_path.exists() {
        make_writable(&cfg_path).map_err(|e| Error::io(&cfg_path, e))?;
    }
    let entry = patch(&cfg_path, &format!("{}/{}", ISOLINUX_DIR, name))?;
    info!(
        "Boot entry '{}' installs with inst.ks={}",
        entry.label(),
        entry.kickstart()
    );

    if let Ok(cfg) = std::fs::read_to_string(&cfg_path) {
        match effective_default(&cfg) {
            Some(label) if label == entry.label() => {
                info!("'{}' is the default boot entry", label)
            }
            Some(label) => warn!(
                "'{}' remains the default boot entry instead of '{}'",
                label,
                entry.label()
            ),
            None => warn!("{} has no default boot entry", cfg_path.to_string_lossy()),
        }
    }

    Ok(entry)
}

#[test]
fn test_config_paths() {
    let config = PipelineConfigBuilder::default()
        .output("/out")
        .kickstart("/tmp/auto.cfg")
        .input("/isos/base.iso")
        .mount_point("/mnt/src")
        .build()
        .unwrap();

    assert_eq!(config.working_dir(), PathBuf::from("/out/working"));
    assert_eq!(config.isolinux_dir(), PathBuf::from("/out/working/isolinux"));
    assert_eq!(config.output_image(), PathBuf::from("/out/custom-base.iso"));
}

#[test]
fn test_config_requires_all_paths() {
    assert!(PipelineConfigBuilder::default()
        .output("/out")
        .kickstart("/tmp/auto.cfg")
        .input("/isos/base.iso")
        .build()
        .is_err());
}

#[test]
fn test_config_volume_label_override() {
    let config = PipelineConfigBuilder::default()
        .output("/out")
        .kickstart("/tmp/auto.cfg")
        .input("/isos/base.iso")
        .mount_point("/mnt/src")
        .volume_label("Fedora Custom")
        .build()
        .unwrap();

    assert_eq!(config.volume_label(), "Fedora Custom");
}

#[test]
fn test_failure_display_keeps_original_error_first() {
    let failure = Failure {
        stage: Stage::Staging,
        state: State::Mounted,
        error: Error::io("/out/working", io::Error::from(ErrorKind::StorageFull)),
        cleanup: Some(Error::Unmount {
            mount_point: PathBuf::from("/mnt/src"),
            source: io::Error::from(ErrorKind::ResourceBusy),
        }),
    };

    let message = failure.to_string();
    assert!(message.starts_with("Copying the source image failed: /out/working: "));
    assert!(message.contains("\nAdditionally, unmounting failed: Failed to unmount /mnt/src: "));
}
