//! Script to create an unattended install ISO from an isolinux-bootable installer ISO
//! and a kickstart file

use std::{path::PathBuf, process::exit};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use ksiso::{
    checkroot, logging_config,
    kickstart::KickstartValidator,
    mkisofs::IsoPackager,
    mount::LoopMounter,
    pipeline::{Pipeline, PipelineConfigBuilder},
};

#[derive(Parser)]
#[command(about = "Create a custom installation ISO with a kickstart file")]
struct Args {
    /// Output directory for the staged tree and the new ISO
    #[arg(short, long)]
    pub output: PathBuf,
    /// Path to the kickstart file
    #[arg(short, long)]
    pub kickstart: PathBuf,
    /// Path to the input ISO
    #[arg(short, long)]
    pub input: PathBuf,
    /// Mount point for the input ISO
    #[arg(short, long)]
    pub mount: PathBuf,
}

fn run(args: Args) -> Result<bool> {
    let config = PipelineConfigBuilder::default()
        .output(args.output)
        .kickstart(args.kickstart)
        .input(args.input)
        .mount_point(args.mount)
        .build()
        .context("Invalid arguments")?;

    let mut pipeline = Pipeline::new(
        config,
        KickstartValidator::detect(),
        LoopMounter,
        IsoPackager::default(),
    );

    match pipeline.run() {
        Ok(success) => {
            info!(
                "Staged {} files into {}",
                success.report.files,
                success.working_dir.to_string_lossy()
            );
            println!("{}", success);
            Ok(true)
        }
        Err(failure) => {
            eprintln!("Error: {}", failure);
            Ok(false)
        }
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = logging_config() {
        eprintln!("Could not configure logging: {}", e);
    }

    let result = checkroot().and_then(|_| run(args));

    match result {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    }
}
