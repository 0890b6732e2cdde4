use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crystalize_contracts::density::Density;
use crystalize_contracts::events::EventLog;
use crystalize_contracts::palette::{ColorSelection, DEFAULT_PALETTE};
use crystalize_contracts::session::Session;
use crystalize_engine::{
    ColorizeRequest, DryrunModel, GeminiModel, ImageModel, Pipeline, DEFAULT_IMAGE_MODEL,
    OUTPUT_FILE_NAME,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(
    name = "crystalize",
    version,
    about = "Recolor crystal micrographs with a generative image model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a micrograph and write the recolored artifact.
    Colorize(ColorizeArgs),
    /// List the available highlight colors.
    Palette,
}

#[derive(Debug, Parser)]
struct ColorizeArgs {
    /// Source micrograph (any common raster format).
    #[arg(long)]
    input: PathBuf,
    /// Output directory for the artifact and event log.
    #[arg(long)]
    out: PathBuf,
    /// Highlight colors, by palette id.
    #[arg(long, value_delimiter = ',', default_value = "red,blue")]
    colors: Vec<String>,
    /// Approximate coverage fraction, 0.1 to 0.9.
    #[arg(long, default_value_t = 0.3)]
    density: f64,
    #[arg(long, default_value = DEFAULT_IMAGE_MODEL)]
    model: String,
    /// Use the deterministic offline model instead of calling Gemini.
    #[arg(long)]
    offline: bool,
    /// Event log path (defaults to <out>/events.jsonl).
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("crystalize error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Colorize(args) => run_colorize(args),
        Command::Palette => {
            print_palette();
            Ok(0)
        }
    }
}

fn run_colorize(args: ColorizeArgs) -> Result<i32> {
    let colors = ColorSelection::from_ids(&args.colors)?;
    if colors.is_empty() {
        bail!("select at least one highlight color (see `crystalize palette`)");
    }
    let density = Density::new(args.density)?;
    let image = fs::read(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let mut session = Session::new();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventLog::new(&events_path, session.id());
    events.append(
        "session_started",
        fields(json!({
            "input": args.input.to_string_lossy(),
            "model": if args.offline { "dryrun" } else { args.model.as_str() },
        })),
    )?;

    if !session.begin_submission() {
        bail!("a submission is already in flight for this session");
    }

    let dryrun;
    let gemini;
    let model: &dyn ImageModel = if args.offline {
        dryrun = DryrunModel::new();
        &dryrun
    } else {
        gemini = GeminiModel::from_env(&args.model);
        &gemini
    };

    let pipeline = Pipeline::with_events(model, events.clone());
    let request = ColorizeRequest {
        image,
        colors,
        density,
    };

    match pipeline.colorize(&request) {
        Ok(result) => {
            let artifact_path = args.out.join(OUTPUT_FILE_NAME);
            fs::write(&artifact_path, &result.png)
                .with_context(|| format!("failed writing {}", artifact_path.display()))?;
            println!(
                "wrote {} ({}x{})",
                artifact_path.display(),
                result.width,
                result.height
            );
            session.complete(result);
            Ok(0)
        }
        Err(err) => {
            session.fail(err.to_string());
            Err(err.into())
        }
    }
}

fn print_palette() {
    for color in &DEFAULT_PALETTE {
        println!(
            "{:<8} {:<8} {:<16} {}",
            color.id, color.label, color.value, color.color_code
        );
    }
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    use image::{ImageFormat, RgbImage};
    use serde_json::Value;

    use super::{run_colorize, ColorizeArgs};

    fn write_source_png(path: &Path, width: u32, height: u32) {
        let canvas = RgbImage::from_pixel(width, height, image::Rgb([120, 120, 120]));
        let mut bytes = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("png encode");
        fs::write(path, bytes).expect("write source");
    }

    fn args(input: &Path, out: &Path) -> ColorizeArgs {
        ColorizeArgs {
            input: input.to_path_buf(),
            out: out.to_path_buf(),
            colors: vec!["red".to_string(), "blue".to_string()],
            density: 0.3,
            model: super::DEFAULT_IMAGE_MODEL.to_string(),
            offline: true,
            events: None,
        }
    }

    #[test]
    fn offline_colorize_writes_matched_artifact_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("micrograph.png");
        let out = temp.path().join("out");
        write_source_png(&input, 120, 80);

        let code = run_colorize(args(&input, &out))?;
        assert_eq!(code, 0);

        let artifact = out.join(super::OUTPUT_FILE_NAME);
        let reloaded = image::load_from_memory(&fs::read(&artifact)?)?;
        assert_eq!((reloaded.width(), reloaded.height()), (120, 80));

        let raw = fs::read_to_string(out.join("events.jsonl"))?;
        let kinds: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("session_started"));
        assert!(kinds.iter().any(|kind| kind == "result_reconciled"));
        Ok(())
    }

    #[test]
    fn empty_color_selection_is_rejected_before_submission() {
        let temp = tempfile::tempdir().expect("tempdir");
        let input = temp.path().join("micrograph.png");
        write_source_png(&input, 16, 16);

        let mut rejected = args(&input, &temp.path().join("out"));
        rejected.colors = Vec::new();
        assert!(run_colorize(rejected).is_err());
    }

    #[test]
    fn out_of_range_density_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let input = temp.path().join("micrograph.png");
        write_source_png(&input, 16, 16);

        let mut rejected = args(&input, &temp.path().join("out"));
        rejected.density = 0.95;
        assert!(run_colorize(rejected).is_err());
    }
}
