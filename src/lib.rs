//! Build custom installation ISOs by injecting a kickstart file and an automatic
//! boot menu entry into an existing isolinux-bootable image.

use std::{
    io::{self, BufRead, BufReader, Cursor},
    process::Output,
};

use anyhow::{bail, Result};
use log::{error, info, LevelFilter};
use nix::unistd::Uid;
use simple_logger::SimpleLogger;

pub mod error;
pub mod isolinux;
pub mod kickstart;
pub mod mkisofs;
pub mod mount;
pub mod pipeline;
pub mod util;

/// Join the captured stdout and stderr of a finished command into one block of
/// diagnostic text
pub fn command_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim_end();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
    }
    text
}

pub fn check_command(result: Result<Output, io::Error>) -> Result<Output> {
    match result {
        Ok(output) => {
            if output.status.success() {
                Ok(output)
            } else {
                error!("Command failed. Output:");

                BufReader::new(Cursor::new(&output.stdout))
                    .lines()
                    .filter_map(|l| l.ok())
                    .for_each(|l| {
                        error!("out: {}", l);
                    });

                BufReader::new(Cursor::new(&output.stderr))
                    .lines()
                    .filter_map(|l| l.ok())
                    .for_each(|l| {
                        error!("err: {}", l);
                    });

                bail!("Command exited with {}", output.status);
            }
        }
        Err(e) => Err(e)?,
    }
}

pub fn checkroot() -> Result<()> {
    if nix::unistd::geteuid() != Uid::from_raw(0) {
        bail!("Must be run as root");
    }

    Ok(())
}

pub fn logging_config() -> Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;
    info!("Logging configured");
    Ok(())
}

#[test]
fn test_command_output_joins_streams() {
    use std::process::Command;

    let output = Command::new("sh")
        .arg("-c")
        .arg("echo out; echo err >&2")
        .output()
        .unwrap();

    assert_eq!(command_output(&output), "out\nerr");
}

#[test]
fn test_check_command_failure() {
    use std::process::Command;

    assert!(check_command(Command::new("sh").arg("-c").arg("exit 0").output()).is_ok());

    let err = check_command(Command::new("sh").arg("-c").arg("exit 3").output()).unwrap_err();
    assert!(err.to_string().contains("exit status: 3"));
}
