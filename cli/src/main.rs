use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use sketchsync::config::{ConfigError, SyncConfig};
use sketchsync::model::{Document, DocumentId};
use sketchsync::notice::{Notice, NoticeLevel};
use sketchsync::session::{Session, SessionError};
use sketchsync::store::StoreError;
use sketchsync::sync::SyncReport;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session failed to start: {0}")]
    Session(#[from] SessionError),
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("{0} failed; see notices above")]
    Failed(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "sketchsync", about = "Offline-first whiteboard document sync")]
struct Cli {
    /// Owner of the documents listed and created.
    #[arg(long, env = "SKETCHSYNC_USER_ID")]
    user_id: Uuid,

    /// Ignore the remote store even if one is configured.
    #[arg(long, default_value_t = false)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List documents, merged with local unsynced copies.
    List,
    Show {
        id: String,
    },
    Create {
        name: String,
    },
    Rename {
        id: String,
        name: String,
    },
    Delete {
        id: String,
    },
    Favorite {
        id: String,
        #[arg(long, default_value_t = false)]
        off: bool,
    },
    /// Replay queued changes against the remote store.
    Sync,
    /// Queue every unsynced local document, then replay.
    ForceSync,
    Status,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: could not read .env: {e}");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if cli.offline {
        config.remote = None;
    }

    let session = Session::start(&config, cli.user_id).await?;
    let mut notices = session.state().notifier.subscribe();
    let result = run(&session, cli.command).await;
    print_notices(&mut notices);
    session.shutdown();
    result
}

async fn run(session: &Session, command: Command) -> Result<(), CliError> {
    let access = session.access();
    match command {
        Command::List => {
            access.fetch_documents().await;
            let rows: Vec<Value> = access.documents().iter().map(|doc| summary(doc)).collect();
            print_json(&Value::Array(rows))
        }
        Command::Show { id } => {
            let doc = open(session, &id).await?;
            print_json(&serde_json::to_value(doc.as_ref())?)
        }
        Command::Create { name } => {
            let doc = access.create_document(&name).await.ok_or(CliError::Failed("create"))?;
            print_json(&summary(&doc))
        }
        Command::Rename { id, name } => {
            let doc = open(session, &id).await?;
            ensure(access.rename_document(&doc.id, &name).await, "rename")
        }
        Command::Delete { id } => {
            let doc = open(session, &id).await?;
            ensure(access.delete_document(&doc.id).await, "delete")
        }
        Command::Favorite { id, off } => {
            let doc = open(session, &id).await?;
            ensure(access.set_favorite(&doc.id, !off).await, "favorite")
        }
        Command::Sync => {
            let report = session.state().queue.sync_pending_changes().await;
            print_json(&report_json(&report))
        }
        Command::ForceSync => {
            let report = session.state().queue.force_sync_all(session.state().user_id).await?;
            print_json(&report_json(&report))
        }
        Command::Status => print_json(&json!({
            "online": access.is_online(),
            "syncing": access.is_syncing(),
            "pending_changes": access.pending_changes(),
        })),
    }
}

async fn open(session: &Session, id: &str) -> Result<std::sync::Arc<Document>, CliError> {
    let id = DocumentId::from(id);
    session.access().load_document(&id).await.ok_or(CliError::NotFound(id))
}

fn ensure(ok: bool, action: &'static str) -> Result<(), CliError> {
    if ok {
        println!("ok");
        Ok(())
    } else {
        Err(CliError::Failed(action))
    }
}

fn summary(doc: &Document) -> Value {
    json!({
        "id": doc.id,
        "name": doc.name,
        "updated_at": doc.updated_at.to_string(),
        "synced": doc.synced,
        "is_favorite": doc.is_favorite,
        "is_public": doc.is_public,
    })
}

fn report_json(report: &SyncReport) -> Value {
    json!({
        "skipped": report.skipped,
        "attempted": report.attempted,
        "succeeded": report.succeeded,
        "failed": report.failed,
        "remapped": report.remapped.iter().map(|r| json!({ "from": r.from, "to": r.to })).collect::<Vec<_>>(),
        "remaining": report.remaining,
    })
}

fn print_notices(rx: &mut broadcast::Receiver<Notice>) {
    while let Ok(notice) = rx.try_recv() {
        let level = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Error => "error",
        };
        match notice.code {
            Some(code) => eprintln!("[{level}] {}: {} ({code})", notice.action, notice.message),
            None => eprintln!("[{level}] {}: {}", notice.action, notice.message),
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
