//! Command-line face fitting.
//!
//! Loads one photograph (or a directory of frames), runs the configured
//! optimization stages and writes checkpoints, loss plots, debug frames and
//! the final mesh/texture artifacts into the output directory.
use face_fitter::config::{load_config, FitConfig};
use face_fitter::driver::{FaceFitter, RunOptions};
use std::env;
use std::path::{Path, PathBuf};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

struct CliArgs {
    input: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    shared_identity: bool,
    checkpoint: Option<PathBuf>,
    skip_stage1: bool,
    skip_stage2: bool,
    skip_stage3: bool,
}

fn usage() -> String {
    let program = env::args()
        .next()
        .unwrap_or_else(|| "face_fit".to_string());
    format!(
        "Usage: {program} --input <image|dir> --output <dir> [--config <json>] \
         [--shared-identity] [--checkpoint <file>] [--skip-stage1] [--skip-stage2] [--skip-stage3]"
    )
}

fn parse_args() -> Result<CliArgs, String> {
    let mut input = None;
    let mut output = None;
    let mut config = None;
    let mut shared_identity = false;
    let mut checkpoint = None;
    let mut skip_stage1 = false;
    let mut skip_stage2 = false;
    let mut skip_stage3 = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                input = Some(PathBuf::from(args.next().ok_or_else(usage)?));
            }
            "--output" => {
                output = Some(PathBuf::from(args.next().ok_or_else(usage)?));
            }
            "--config" => {
                config = Some(PathBuf::from(args.next().ok_or_else(usage)?));
            }
            "--checkpoint" => {
                checkpoint = Some(PathBuf::from(args.next().ok_or_else(usage)?));
            }
            "--shared-identity" => shared_identity = true,
            "--skip-stage1" => skip_stage1 = true,
            "--skip-stage2" => skip_stage2 = true,
            "--skip-stage3" => skip_stage3 = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("Unknown argument '{other}'\n{}", usage())),
        }
    }

    Ok(CliArgs {
        input: input.ok_or_else(|| format!("Missing --input\n{}", usage()))?,
        output: output.ok_or_else(|| format!("Missing --output\n{}", usage()))?,
        config,
        shared_identity,
        checkpoint,
        skip_stage1,
        skip_stage2,
        skip_stage3,
    })
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => FitConfig::default(),
    };
    std::fs::create_dir_all(&args.output)
        .map_err(|e| format!("Failed to create {}: {e}", args.output.display()))?;

    let mut fitter = FaceFitter::new(&args.output, config);
    fitter.set_input(Path::new(&args.input), args.shared_identity)?;

    let options = RunOptions {
        skip_pose: args.skip_stage1,
        skip_appearance: args.skip_stage2,
        skip_texture: args.skip_stage3,
        resume_checkpoint: args.checkpoint.clone(),
    };
    let report = fitter.run(&options)?;

    println!(
        "Fitted {} frame(s) in {:.2} s; artifacts in {}",
        report.frames,
        report.total_ms / 1000.0,
        args.output.display()
    );
    for stage in &report.stages {
        println!(
            "  {}: {} iterations, loss {} -> {}",
            stage.stage,
            stage.iterations,
            stage
                .initial_loss
                .map(|l| format!("{l:.5}"))
                .unwrap_or_else(|| "-".to_string()),
            stage
                .final_loss
                .map(|l| format!("{l:.5}"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}
