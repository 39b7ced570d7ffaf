//! surround-view CLI: run a rig calibration from still frames, or undistort
//! fisheye frames.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use surround_view::calib::{CameraModel, CameraParams};
use surround_view::{CalibrationSession, SessionConfig, StageOutput, ViewState};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "surround-view")]
#[command(about = "Calibrate a four-camera fisheye surround-view rig")]
#[command(version)]
struct Cli {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every calibration view and write meshes, masks and compensator.
    Calibrate(CalibrateArgs),

    /// Undistort fisheye frames through a camera model.
    Undistort(UndistortArgs),

    /// Write a default session config.
    InitConfig {
        /// Where to write the JSON config.
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Session config (JSON). Relative paths inside resolve against its directory.
    #[arg(long)]
    config: PathBuf,

    /// One frame per camera, in rig order.
    #[arg(long, num_args = 1..)]
    frames: Vec<PathBuf>,

    /// Override the config's output directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct UndistortArgs {
    /// OCamCalib model file.
    #[arg(long)]
    model: PathBuf,

    /// Undistortion zoom.
    #[arg(long, default_value_t = 2.0)]
    scale_factor: f64,

    /// Directory for the undistorted frames.
    #[arg(long)]
    out_dir: PathBuf,

    /// Fisheye frames to undistort.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn init_logging(level: &str) -> CliResult<()> {
    #[cfg(feature = "tracing")]
    {
        surround_view::core::init_tracing(level);
        let _ = tracing_log::LogTracer::init();
        Ok(())
    }
    #[cfg(not(feature = "tracing"))]
    {
        surround_view::core::init_with_level(surround_view::core::parse_level(level))?;
        Ok(())
    }
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Calibrate(args) => run_calibrate(&args),
        Commands::Undistort(args) => run_undistort(&args),
        Commands::InitConfig { out } => {
            SessionConfig::default().write_json(&out)?;
            log::info!("default config written to {}", out.display());
            Ok(())
        }
    }
}

// ── calibrate ─────────────────────────────────────────────────────────

fn run_calibrate(args: &CalibrateArgs) -> CliResult<()> {
    let mut config = SessionConfig::load_json(&args.config)?;
    if let Some(base) = args.config.parent() {
        config.rebase(base);
    }
    if let Some(out) = &args.out_dir {
        config.output_dir = out.clone();
    }
    if args.frames.len() != config.cameras.len() {
        return Err(format!(
            "{} frames given for {} cameras",
            args.frames.len(),
            config.cameras.len()
        )
        .into());
    }

    let mut frames = args
        .frames
        .iter()
        .map(|p| -> CliResult<image::RgbImage> { Ok(image::open(p)?.to_rgb8()) })
        .collect::<CliResult<Vec<_>>>()?;

    let mut session = CalibrationSession::new(config)?;
    while session.state() != ViewState::Result {
        let report = session.advance(&mut frames)?;
        for failure in &report.failures {
            match failure.camera {
                Some(camera) => eprintln!("  camera {camera}: {}", failure.message),
                None => eprintln!("  {}", failure.message),
            }
        }
        match &report.output {
            StageOutput::Lines(lines) => println!("{}: {} segments", report.state, lines.len()),
            StageOutput::Previews(meshes) => {
                println!("{}: {} preview meshes", report.state, meshes.len())
            }
            StageOutput::Saved(paths) => {
                println!("{}: {} files", report.state, paths.len());
                for p in paths {
                    println!("  {}", p.display());
                }
            }
            StageOutput::None => println!("{}", report.state),
        }
    }
    Ok(())
}

// ── undistort ─────────────────────────────────────────────────────────

fn run_undistort(args: &UndistortArgs) -> CliResult<()> {
    let params = CameraParams {
        model: args.model.clone(),
        scale_factor: args.scale_factor,
        ..CameraParams::default()
    };
    let camera = CameraModel::load(0, &params)?;
    std::fs::create_dir_all(&args.out_dir)?;
    for input in &args.inputs {
        let frame = image::open(input)?.to_rgb8();
        let undistorted = camera.undistort(&frame)?;
        let out = args.out_dir.join(output_name(input));
        undistorted.save(&out)?;
        println!("{} -> {}", input.display(), out.display());
    }
    Ok(())
}

fn output_name(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    PathBuf::from(format!("{stem}_undistorted.png"))
}
