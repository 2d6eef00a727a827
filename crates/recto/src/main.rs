//! Batch command-line front end for the recto pipeline.
//!
//! Takes scan images in document order, runs every page through the full
//! correction chain on background workers, writes the rendered pages to
//! an output directory, and keeps per-page settings in a project file so
//! re-runs only process pages whose cached results went stale.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info, warn};

use recto_engine::{Engine, describe_page};
use recto_pipeline::stages::output::ColorMode;
use recto_pipeline::{
    ChainOutcome, DefaultBundles, Element, ImageId, Margins, PageId, PageInfo, PresentationHost,
    ProjectIndex, RgbaImage, StageError, StageKind, Stages, SubPage,
};

/// Batch post-processor for scanned document pages.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Input scan images, in document order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for rendered output pages.
    #[arg(short, long)]
    out_dir: PathBuf,

    /// Project settings file (JSON) to load and update.
    ///
    /// With a project file, pages whose cached results are still valid
    /// and whose output already exists are skipped.
    #[arg(long)]
    project: Option<PathBuf>,

    /// Output rendering: "color", "grayscale", or "black-and-white".
    #[arg(long, default_value = "black-and-white", value_parser = parse_color_mode)]
    color_mode: ColorMode,

    /// Binarization threshold for black-and-white output.
    #[arg(long, default_value_t = 128)]
    threshold: u8,

    /// Margin width in pixels added around detected content.
    #[arg(long, default_value_t = 20)]
    margin: u32,

    /// Worker threads. Defaults to one per logical CPU.
    #[arg(long)]
    jobs: Option<usize>,

    /// Reprocess every page, even ones with valid cached results.
    #[arg(long)]
    force: bool,
}

fn parse_color_mode(value: &str) -> Result<ColorMode, String> {
    ColorMode::from_tag(value).ok_or_else(|| {
        format!("unknown color mode '{value}' (expected color, grayscale, or black-and-white)")
    })
}

/// Presentation host that writes finished pages to the output directory.
struct FileHost {
    out_dir: PathBuf,
    written: usize,
    failed: usize,
}

impl PresentationHost for FileHost {
    fn show_page(&mut self, page_id: &PageId, _origin: StageKind, image: &RgbaImage) {
        let path = self.out_dir.join(output_name(page_id));
        match image.save(&path) {
            Ok(()) => {
                self.written += 1;
                info!("wrote {}", path.display());
            }
            Err(err) => {
                self.failed += 1;
                error!("failed to write {}: {err}", path.display());
            }
        }
    }

    fn show_failure(&mut self, page_id: &PageId, origin: StageKind, stage_error: &StageError) {
        self.failed += 1;
        error!(
            "{}: {origin} failed: {stage_error}",
            page_id.image_id().path().display(),
        );
    }
}

/// Output file name for a page: source stem plus frame and sub-page
/// qualifiers where they disambiguate.
fn output_name(page_id: &PageId) -> String {
    let image = page_id.image_id();
    let stem = image
        .path()
        .file_stem()
        .map_or_else(|| "page".to_string(), |s| s.to_string_lossy().into_owned());
    let mut name = stem;
    if image.frame() > 0 {
        name.push_str(&format!("-f{}", image.frame()));
    }
    match page_id.sub_page() {
        SubPage::Single => {}
        SubPage::Left => name.push_str("-left"),
        SubPage::Right => name.push_str("-right"),
    }
    name.push_str(".png");
    name
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating output directory {}", args.out_dir.display()))?;

    let mut defaults = DefaultBundles::default();
    defaults.margins.margins = Margins::uniform(args.margin);
    defaults.output.color_mode = args.color_mode;
    defaults.output.threshold = args.threshold;
    let stages = Arc::new(Stages::new(&defaults));

    // Describe every input once; unreadable files are reported and
    // skipped so one bad scan does not sink the batch.
    let mut infos: Vec<PageInfo> = Vec::new();
    for input in &args.inputs {
        let page = PageId::single(ImageId::new(input.clone(), 0));
        match describe_page(page) {
            Ok(info) => infos.push(info),
            Err(err) => warn!("skipping {}: {err}", input.display()),
        }
    }
    if infos.is_empty() {
        bail!("no readable input pages");
    }

    let index = ProjectIndex::new(infos.iter().map(|info| info.id().clone()).collect());
    if let Some(path) = &args.project {
        if path.exists() {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading project file {}", path.display()))?;
            match serde_json::from_str::<Element>(&json) {
                Ok(root) => stages.load_project(&index, &root),
                Err(err) => warn!("ignoring unreadable project file: {err}"),
            }
        }
    }

    let engine = match args.jobs {
        Some(jobs) => Engine::with_workers(Arc::clone(&stages), jobs)?,
        None => Engine::new(Arc::clone(&stages))?,
    };

    let stale: HashSet<PageId> = engine
        .find_stale(&infos, StageKind::Output)
        .into_iter()
        .collect();
    let to_run: Vec<PageInfo> = infos
        .iter()
        .filter(|info| {
            args.force
                || stale.contains(info.id())
                || !args.out_dir.join(output_name(info.id())).exists()
        })
        .cloned()
        .collect();
    info!(
        "{} of {} pages need processing",
        to_run.len(),
        infos.len(),
    );

    for info in &to_run {
        engine.submit(info.clone(), StageKind::Output, true, false);
    }

    let mut host = FileHost {
        out_dir: args.out_dir.clone(),
        written: 0,
        failed: 0,
    };
    for _ in 0..to_run.len() {
        let delivery = engine
            .results()
            .recv()
            .context("worker pool shut down before all pages finished")?;
        match &delivery.outcome {
            ChainOutcome::Finished(command) => command.deliver(&mut host),
            ChainOutcome::Cancelled => {}
        }
    }

    if let Some(path) = &args.project {
        let document = stages.save_project(&index);
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing project file {}", path.display()))?;
        info!("saved project settings to {}", path.display());
    }

    info!("done: {} written, {} failed", host.written, host.failed);
    if host.written == 0 && host.failed > 0 {
        bail!("every page failed to process");
    }
    Ok(())
}
