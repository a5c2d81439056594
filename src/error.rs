//! Error taxonomy shared by every pipeline stage

use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The kickstart file is malformed. Raised before anything is mounted or copied.
    #[error("Invalid kickstart file {}: {reason}", .path.display())]
    Validation { path: PathBuf, reason: String },
    #[error("{what} not found: {}", .path.display())]
    NotFound { what: &'static str, path: PathBuf },
    #[error("Failed to mount {} at {}: {source}", .image.display(), .mount_point.display())]
    Mount {
        image: PathBuf,
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to unmount {}: {source}", .mount_point.display())]
    Unmount {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The image generator exited unsuccessfully, `diagnostics` holds its captured output
    #[error("{program} failed: {reason}{}", diagnostics_suffix(.diagnostics))]
    Packaging {
        program: String,
        reason: String,
        diagnostics: String,
    },
    #[error("Mount point {} is locked by another job", .mount_point.display())]
    Locked { mount_point: PathBuf },
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\n{}", diagnostics)
    }
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Error::NotFound {
            what,
            path: path.into(),
        }
    }
}

#[test]
fn test_packaging_message_includes_diagnostics() {
    let err = Error::Packaging {
        program: "genisoimage".to_string(),
        reason: "exit status: 1".to_string(),
        diagnostics: "genisoimage: Uh oh, I cant find the boot image".to_string(),
    };

    assert_eq!(
        err.to_string(),
        "genisoimage failed: exit status: 1\ngenisoimage: Uh oh, I cant find the boot image"
    );
}

#[test]
fn test_io_message_names_path() {
    let err = Error::io(
        "/out/working/isolinux/isolinux.cfg",
        io::Error::from(io::ErrorKind::PermissionDenied),
    );

    assert!(err
        .to_string()
        .starts_with("/out/working/isolinux/isolinux.cfg: "));
}
