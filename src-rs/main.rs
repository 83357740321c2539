use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use avatar_override::actions::{MenuAction, OverrideActions, Subject};
use avatar_override::config::{settings_path, FileSettingsStore, Settings};
use avatar_override::engine::Engine;
use avatar_override::host::{FixedUser, LogNotifier, Notifier, PathPicker, ToastKind};
use avatar_override::matcher::AvatarUrlMatcher;
use avatar_override::store::{MemorySettingsStore, OverrideStore};
use avatar_override::tree::{ImageElement, ManualScheduler, MemoryImage, MemoryTree, Mutation};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "avatar-override",
    version,
    about = "Manage client-side avatar overrides and dry-run the reconciliation engine"
)]
struct Cli {
    /// Settings file (default: $AVATAR_OVERRIDE_SETTINGS or .avatar-override/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// List stored overrides
    List(ListArgs),
    /// Extract subject id and hash from an avatar URL
    Match(MatchArgs),
    /// Store a replacement avatar for a subject
    Set(SetArgs),
    /// Remove a subject's override
    Reset(ResetArgs),
    /// Run the engine over in-memory images and print what each one displays
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Print JSON instead of one line per subject
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct MatchArgs {
    url: String,
}

#[derive(Args, Debug)]
struct SetArgs {
    subject_id: String,
    image: PathBuf,
    /// Current avatar hash of the subject; without it the override never expires
    #[arg(long)]
    hash: Option<String>,
    /// Override the configured max width/height
    #[arg(long)]
    max_size: Option<u32>,
    /// Override the configured JPEG quality (0.1 - 1)
    #[arg(long)]
    quality: Option<f32>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    subject_id: String,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Image sources to place in the simulated tree
    #[arg(required = true)]
    urls: Vec<String>,
}

/// Remembers whether a failure toast was shown so the CLI can exit non-zero.
#[derive(Default)]
struct CliNotifier {
    failed: std::cell::Cell<bool>,
}

impl Notifier for CliNotifier {
    fn show(&self, message: &str, kind: ToastKind) {
        LogNotifier.show(message, kind);
        match kind {
            ToastKind::Success => println!("{message}"),
            ToastKind::Failure => {
                self.failed.set(true);
                eprintln!("{message}");
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let path = settings_path(cli.settings.as_deref());

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::List(args) => command_list(path, args),
        Commands::Match(args) => command_match(path, args),
        Commands::Set(args) => command_set(path, args),
        Commands::Reset(args) => command_reset(path, args),
        Commands::Simulate(args) => command_simulate(path, args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({"name": "list", "description": "List stored avatar overrides."}),
        json!({"name": "match", "description": "Parse an avatar URL into subject id and hash."}),
        json!({"name": "set", "description": "Downscale an image and store it as a subject's override."}),
        json!({"name": "reset", "description": "Remove a subject's override."}),
        json!({"name": "simulate", "description": "Reconcile in-memory images against the stored overrides."}),
    ];
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn open_store(path: PathBuf) -> Result<Rc<OverrideStore<FileSettingsStore>>> {
    let settings = FileSettingsStore::open(&path)
        .with_context(|| format!("failed to load settings: {}", path.display()))?;
    Ok(Rc::new(OverrideStore::new(settings)))
}

fn load_settings(path: &std::path::Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("failed to load settings: {}", path.display()))
}

fn command_list(path: PathBuf, args: ListArgs) -> Result<()> {
    let store = open_store(path)?;
    let overrides = store.get();

    if args.json {
        let rows: Vec<Value> = overrides
            .iter()
            .map(|(subject_id, entry)| {
                json!({
                    "subjectId": subject_id,
                    "avatarHash": entry.expected_hash,
                    "payloadBytes": entry.payload.len(),
                })
            })
            .collect();
        let payload = json!({
            "generated_at": Utc::now().to_rfc3339(),
            "settings_path": store.settings().path().display().to_string(),
            "overrides": rows,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if overrides.is_empty() {
        println!("no overrides");
    }
    for (subject_id, entry) in overrides.iter() {
        println!(
            "{subject_id}\t{}\t{} bytes",
            entry.expected_hash.as_deref().unwrap_or("-"),
            entry.payload.len()
        );
    }
    Ok(())
}

fn command_match(path: PathBuf, args: MatchArgs) -> Result<()> {
    let matcher = load_settings(&path)?
        .matcher()
        .context("invalid knownHosts in settings")?;
    let parsed = matcher
        .parse(&args.url)
        .map(|avatar| json!({"subjectId": avatar.subject_id, "hash": avatar.hash}))
        .unwrap_or(Value::Null);
    println!("{}", serde_json::to_string(&parsed)?);
    Ok(())
}

fn command_set(path: PathBuf, args: SetArgs) -> Result<()> {
    if !args.image.exists() {
        bail!("image not found: {}", args.image.display());
    }
    let store = open_store(path)?;
    let mut options = store.settings().settings().acquire_options();
    if let Some(max_size) = args.max_size {
        options.max_dimension_px = max_size.max(1);
    }
    if let Some(quality) = args.quality {
        options.quality = quality;
    }

    let notifier = CliNotifier::default();
    let actions = OverrideActions::new(
        store,
        PathPicker::new(&args.image),
        &notifier,
        FixedUser(None),
        options,
    );
    actions.run(&Subject::new(args.subject_id, args.hash), MenuAction::Change);
    if notifier.failed.get() {
        bail!("override was not saved");
    }
    Ok(())
}

fn command_reset(path: PathBuf, args: ResetArgs) -> Result<()> {
    let store = open_store(path)?;
    let notifier = CliNotifier::default();
    let actions = OverrideActions::new(
        store,
        PathPicker::cancelled(),
        &notifier,
        FixedUser(None),
        Default::default(),
    );
    if !actions.run(&Subject::new(args.subject_id.clone(), None), MenuAction::Reset) {
        if notifier.failed.get() {
            bail!("override was not removed");
        }
        println!("no override for {}", args.subject_id);
    }
    Ok(())
}

/// Dry run: evictions only touch an in-memory copy of the stored overrides.
fn command_simulate(path: PathBuf, args: SimulateArgs) -> Result<()> {
    let settings = load_settings(&path)?;
    let matcher: AvatarUrlMatcher = settings
        .matcher()
        .context("invalid knownHosts in settings")?;
    let store = Rc::new(OverrideStore::new(MemorySettingsStore::new(
        settings.overrides_json.clone(),
    )));

    let tree = MemoryTree::new();
    let scheduler = ManualScheduler::new();
    let images: Vec<Rc<MemoryImage>> = args.urls.iter().map(MemoryImage::new).collect();

    let mut engine = Engine::new(Rc::clone(&tree), Rc::clone(&scheduler), store, matcher);
    engine.start();
    let mutations: Vec<Mutation> = images
        .iter()
        .map(|image| tree.insert(Rc::clone(image)))
        .collect();
    engine.notify(&mutations);
    let report = engine.run_frame().unwrap_or_default();

    let rows: Vec<Value> = args
        .urls
        .iter()
        .zip(&images)
        .map(|(url, image)| {
            let shown = image.src();
            json!({
                "source": url,
                "overridden": shown != *url,
                "displayed": truncate_text(&shown, 64),
            })
        })
        .collect();

    let remaining = engine.overrides().len();
    let restored = engine.stop();
    let leftovers = args
        .urls
        .iter()
        .zip(&images)
        .filter(|(url, image)| image.src() != **url)
        .count();
    if leftovers > 0 {
        bail!("{leftovers} element(s) were not restored on stop");
    }

    let payload = json!({
        "frame_requests": scheduler.requests(),
        "scan": {
            "visited": report.visited,
            "overridden": report.overridden,
            "evicted": report.evicted,
            "passes": report.passes,
        },
        "overrides_remaining": remaining,
        "restored_on_stop": restored,
        "elements": rows,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push('…');
    out
}
