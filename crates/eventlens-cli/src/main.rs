use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "eventlens", about = "EventLens event photo gallery CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List events
    Events,
    /// List the photos of an event
    Photos { event: String },
    /// Create an event
    CreateEvent {
        #[arg(short, long)]
        name: String,
        /// Event date (YYYY-MM-DD)
        #[arg(short, long)]
        date: String,
        #[arg(short, long, default_value = "")]
        location: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Explicit id; derived from the name when omitted
        #[arg(long)]
        id: Option<String>,
        /// Storage limit in MiB
        #[arg(long)]
        limit_mb: Option<u64>,
        /// Photographer access code; generated when omitted
        #[arg(long)]
        code: Option<String>,
    },
    /// Upload photos into an event
    Upload {
        event: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the state of an upload
    UploadStatus { id: String },
    /// Find the photos of an event that show the person in a selfie
    Find {
        event: String,
        selfie: PathBuf,
        /// Number of matches (daemon default when omitted)
        #[arg(short, default_value_t = 0)]
        k: u32,
    },
    /// Show admin usage aggregates
    Usage,
    /// Ask the caption provider whether the events need more storage
    AnalyzeStorage,
    /// Re-run face detection for photos that were never indexed
    Reindex { event: String },
    /// Reload the face models
    ReloadModels,
}

#[zbus::proxy(
    interface = "org.eventlens.Gallery1",
    default_service = "org.eventlens.Gallery1",
    default_path = "/org/eventlens/Gallery1"
)]
trait Gallery {
    fn status(&self) -> zbus::Result<String>;
    fn list_events(&self) -> zbus::Result<String>;
    fn list_photos(&self, event_id: &str) -> zbus::Result<String>;
    fn create_event(&self, json: &str) -> zbus::Result<String>;
    fn upload(&self, event_id: &str, paths: Vec<String>) -> zbus::Result<String>;
    fn upload_status(&self, upload_id: &str) -> zbus::Result<String>;
    fn find_matches(&self, event_id: &str, selfie_path: &str, k: u32) -> zbus::Result<String>;
    fn usage(&self) -> zbus::Result<String>;
    fn analyze_storage(&self) -> zbus::Result<String>;
    fn reindex_pending(&self, event_id: &str) -> zbus::Result<u32>;
    fn reload_models(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(system = cli.system, "connected to D-Bus");
    let gallery = GalleryProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => print_json(&gallery.status().await?),
        Commands::Events => print_json(&gallery.list_events().await?),
        Commands::Photos { event } => print_json(&gallery.list_photos(&event).await?),
        Commands::CreateEvent { name, date, location, description, id, limit_mb, code } => {
            let request = new_event_json(&name, &date, &location, &description, id, limit_mb, code);
            print_json(&gallery.create_event(&request.to_string()).await?)
        }
        Commands::Upload { event, files } => {
            // The daemon reads the files itself, so hand it absolute paths.
            let paths = files.iter().map(|p| absolute(p)).collect::<Result<Vec<_>>>()?;
            print_json(&gallery.upload(&event, paths).await?)
        }
        Commands::UploadStatus { id } => print_json(&gallery.upload_status(&id).await?),
        Commands::Find { event, selfie, k } => {
            let selfie = absolute(&selfie)?;
            print_json(&gallery.find_matches(&event, &selfie, k).await?)
        }
        Commands::Usage => print_json(&gallery.usage().await?),
        Commands::AnalyzeStorage => print_json(&gallery.analyze_storage().await?),
        Commands::Reindex { event } => {
            let queued = gallery.reindex_pending(&event).await?;
            println!("{queued} photo(s) queued for indexing");
        }
        Commands::ReloadModels => print_json(&gallery.reload_models().await?),
    }

    Ok(())
}

fn new_event_json(
    name: &str,
    date: &str,
    location: &str,
    description: &str,
    id: Option<String>,
    limit_mb: Option<u64>,
    code: Option<String>,
) -> serde_json::Value {
    let mut request = serde_json::json!({
        "name": name,
        "date": date,
        "location": location,
        "description": description,
    });
    if let Some(id) = id {
        request["id"] = id.into();
    }
    if let Some(mb) = limit_mb {
        request["storage_limit"] = mb.saturating_mul(1024 * 1024).into();
    }
    if let Some(code) = code {
        request["access_code"] = code.into();
    }
    request
}

fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("cannot access {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Pretty-print a JSON reply, falling back to the raw text.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}
