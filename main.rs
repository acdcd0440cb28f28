use clap::{Args, Parser, Subcommand};
use hybrid_tagger::config::Settings;
use hybrid_tagger::context::{ClassifyReport, ModelContext};
use hybrid_tagger::error::{Error, Result};
use hybrid_tagger::hybrid::ClassifyOptions;
use hybrid_tagger::models::{Category, ClassifyMethod, ValidationDecision};
use hybrid_tagger::scan::{collect_images, content_id};
use hybrid_tagger::tag_store::{JsonTagStore, TagStore};
use hybrid_tagger::worker::run_with_timeout;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOURCE_HYBRID: &str = "hybrid";
const SOURCE_MANUAL: &str = "manual";

#[derive(Parser, Debug)]
#[command(name = "hybrid-tagger")]
#[command(about = "Tags photos with people/animals/food/scenery/document categories")]
#[command(version)]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true, env = "HYBRID_TAGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `models.models_dir` from the settings
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify images or directories of images
    Classify(ClassifyArgs),
    /// Read or edit stored tags
    #[command(subcommand)]
    Tags(TagsCommand),
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Semantic classifier threshold (defaults to `semantic.base_threshold`)
    #[arg(long)]
    threshold: Option<f32>,

    #[arg(long)]
    max_tags: Option<usize>,

    /// Category the caller expects; enables the progressive threshold search
    #[arg(long = "expect", value_name = "CATEGORY")]
    expect: Vec<Category>,

    /// Cross-check fast-path results with the semantic classifier
    #[arg(long)]
    validate: bool,

    /// Persist results to this tag store
    #[arg(long, value_name = "FILE")]
    store: Option<PathBuf>,

    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum TagsCommand {
    Get {
        photo_id: String,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    Set {
        photo_id: String,
        #[arg(required = true)]
        tags: Vec<String>,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
    Mv {
        old_id: String,
        new_id: String,
        #[arg(long, value_name = "FILE")]
        store: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ImageEntry<'a> {
    path: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_id: Option<String>,
    tags: &'a [Category],
    all_detections: &'a BTreeSet<String>,
    method: ClassifyMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<&'a ValidationDecision>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = cli.models_dir {
        settings.models.models_dir = dir;
    }
    match cli.command {
        Command::Classify(args) => classify(settings, args),
        Command::Tags(cmd) => tags(&settings, cmd),
    }
}

fn classify(settings: Settings, args: ClassifyArgs) -> Result<()> {
    let images = collect_images(&args.paths)?;
    if images.is_empty() {
        log::warn!("No images found");
        return Ok(());
    }
    let mut options = ClassifyOptions::from_config(&settings.semantic);
    if let Some(threshold) = args.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!("--threshold must be within [0, 1], got {threshold}")));
        }
        options.threshold = threshold;
    }
    if args.max_tags.is_some() {
        options.max_tags = args.max_tags;
    }
    if !args.expect.is_empty() {
        options.expected_tags = Some(args.expect.clone());
    }
    options.validate = args.validate;

    let ctx = ModelContext::from_settings(settings);
    ctx.preload()?;
    log::info!("Classifying {} images", images.len());

    let report = match args.timeout_ms {
        Some(ms) => {
            let ctx = ctx.clone();
            let owned = images.clone();
            run_with_timeout(Duration::from_millis(ms), move || {
                let refs: Vec<&Path> = owned.iter().map(PathBuf::as_path).collect();
                ctx.classify(&refs, &options)
            })?
        }
        None => {
            let refs: Vec<&Path> = images.iter().map(PathBuf::as_path).collect();
            ctx.classify(&refs, &options)?
        }
    };

    let store = args.store.as_deref().map(JsonTagStore::open).transpose()?;
    let mut ids = Vec::with_capacity(images.len());
    for (path, result) in images.iter().zip(&report.results) {
        let id = match &store {
            Some(store) => {
                let id = content_id(path)?;
                let detections: Vec<String> = result.all_detections.iter().cloned().collect();
                store.set_tags(&id, &result.tag_strings(), SOURCE_HYBRID, Some(&detections))?;
                Some(id)
            }
            None => None,
        };
        ids.push(id);
    }

    print_report(&images, ids, &report, args.json)
}

fn print_report(
    images: &[PathBuf],
    ids: Vec<Option<String>>,
    report: &ClassifyReport,
    json: bool,
) -> Result<()> {
    let entries: Vec<ImageEntry> = images
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(idx, (path, photo_id))| ImageEntry {
            path,
            photo_id,
            tags: &report.results[idx].tags,
            all_detections: &report.results[idx].all_detections,
            method: report.methods[idx],
            validation: report.validations[idx].as_ref(),
        })
        .collect();

    if json {
        let out = serde_json::json!({ "images": entries, "stats": report.stats });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for entry in &entries {
        let tags: Vec<&str> = entry.tags.iter().map(|t| t.as_str()).collect();
        println!(
            "{}: {} [{:?}]",
            entry.path.display(),
            tags.join(", "),
            entry.method
        );
        if let Some(decision) = entry.validation {
            println!("  validation: {}", decision.reason);
        }
    }
    let stats = &report.stats;
    println!(
        "{} images, {} fast path ({:.0}%), {} semantic, {:.1}ms total",
        stats.total_images,
        stats.fast_success,
        stats.fast_success_percent(),
        stats.fallback,
        stats.total_time.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn open_store(settings: &Settings, store: Option<PathBuf>) -> Result<JsonTagStore> {
    JsonTagStore::open(store.unwrap_or_else(|| settings.store.path.clone()))
}

fn tags(settings: &Settings, cmd: TagsCommand) -> Result<()> {
    match cmd {
        TagsCommand::Get { photo_id, store } => {
            let store = open_store(settings, store)?;
            match store.get_record(&photo_id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("[]"),
            }
        }
        TagsCommand::Set {
            photo_id,
            tags,
            store,
        } => {
            let store = open_store(settings, store)?;
            store.set_tags(&photo_id, &tags, SOURCE_MANUAL, None)?;
            println!("{photo_id}: {}", tags.join(", "));
        }
        TagsCommand::Mv {
            old_id,
            new_id,
            store,
        } => {
            let store = open_store(settings, store)?;
            if !store.move_tags(&old_id, &new_id)? {
                return Err(Error::Store(format!("No tags stored for {old_id}")));
            }
            println!("{old_id} -> {new_id}");
        }
    }
    Ok(())
}
