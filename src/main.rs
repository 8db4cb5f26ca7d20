//! # kbase CLI (`kb`)
//!
//! The `kb` binary is the command-line interface to the knowledge engine.
//! It provides commands for database initialization, document upload,
//! retrieval, permission management, and similarity search.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./kb.toml --as alice <command>
//! ```
//!
//! Every command runs as the identity given by `--as`; omitting it runs
//! anonymously, which permits reads of public entries only.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb add <file>` | Upload a source document (caller becomes owner) |
//! | `kb list` | List knowledge entries visible to the caller |
//! | `kb show <id>` | Print one entry's metadata and grants |
//! | `kb fetch <id>` | Download the stored source bytes |
//! | `kb update <id> <file>` | Replace an entry's source document |
//! | `kb delete <id>` | Delete an entry (owner or admin) |
//! | `kb retry <id>` | Re-run a failed ingestion |
//! | `kb grant <id> <user> <perm>` | Grant READONLY or READWRITE |
//! | `kb revoke <id> <user>` | Revoke a grant |
//! | `kb tag <id> <tag>` | Add a tag |
//! | `kb untag <id> <tag>` | Remove a tag |
//! | `kb label <id> [label]` | Set or clear the display label |
//! | `kb search "<query>"` | Similarity search over visible segments |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use kbase::access::{AccessPolicy, ConfigUserDirectory};
use kbase::config::{self, Config};
use kbase::db;
use kbase::embedding::HashEmbedder;
use kbase::index::KnowledgeIndex;
use kbase::ingest::LocalDispatcher;
use kbase::manager::KnowledgeManager;
use kbase::migrate;
use kbase::models::{Identity, Knowledge};
use kbase::permission::Permission;
use kbase::storage;
use kbase::vector::SqliteVectorStore;

/// kbase CLI — a knowledge store with content dedup, access control, and
/// permission-scoped similarity search.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "kbase — knowledge consistency and access-control engine",
    version,
    long_about = "kbase keeps a blob store, a SQLite index, and a vector store in agreement \
    about a corpus of uploaded documents. Uploads are deduplicated by content checksum, \
    ingestion runs asynchronously, and every command is checked against the caller's \
    capability (NONE < READONLY < READWRITE < OWNER)."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./kb.toml")]
    config: PathBuf,

    /// Username to run as. Omit to run anonymously (public reads only).
    #[arg(long = "as", global = true, value_name = "USER")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Upload a source document. The caller becomes its owner.
    Add {
        /// Path to the file to upload.
        file: PathBuf,

        /// Override the detected content type.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// List knowledge entries visible to the caller.
    List,

    /// Print one entry's metadata, tags, and permission grants.
    Show {
        /// Knowledge id (UUID).
        id: String,
    },

    /// Download the stored source bytes for an entry.
    Fetch {
        /// Knowledge id (UUID).
        id: String,

        /// Write to this path instead of the original file name.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Replace an entry's source document (requires READWRITE).
    ///
    /// Uploading a file whose content matches the current checksum is a
    /// successful no-op.
    Update {
        /// Knowledge id (UUID).
        id: String,

        /// Path to the replacement file.
        file: PathBuf,

        /// Override the detected content type.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Delete an entry and its derived artifacts (owner or admin).
    Delete {
        /// Knowledge id (UUID).
        id: String,
    },

    /// Re-run ingestion for an entry whose last ingestion failed.
    Retry {
        /// Knowledge id (UUID).
        id: String,
    },

    /// Grant a capability to a user (owner or admin).
    ///
    /// Only READONLY and READWRITE can be granted; OWNER is fixed at
    /// creation. Use the reserved user `ANY` to make an entry public.
    Grant {
        /// Knowledge id (UUID).
        id: String,
        /// Target username, or `ANY`.
        username: String,
        /// `readonly` or `readwrite`.
        permission: String,
    },

    /// Revoke a user's grant (owner or admin).
    Revoke {
        /// Knowledge id (UUID).
        id: String,
        /// Target username, or `ANY`.
        username: String,
    },

    /// Add a tag to an entry (requires READWRITE).
    Tag {
        /// Knowledge id (UUID).
        id: String,
        /// Tag to add.
        tag: String,
    },

    /// Remove a tag from an entry (requires READWRITE).
    Untag {
        /// Knowledge id (UUID).
        id: String,
        /// Tag to remove.
        tag: String,
    },

    /// Set or clear the display label (requires READWRITE).
    Label {
        /// Knowledge id (UUID).
        id: String,
        /// New label. Omit to clear.
        label: Option<String>,
    },

    /// Similarity search over segments the caller may see.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Wiring shared by every command that touches the stores.
struct App {
    policy: AccessPolicy,
    dispatcher: Arc<LocalDispatcher>,
}

async fn build_app(cfg: &Config, identity: Identity) -> anyhow::Result<App> {
    let pool = db::connect(&cfg.db.path).await?;
    let index = KnowledgeIndex::new(pool.clone());
    let blobs = storage::from_config(&cfg.storage)?;
    let vectors = Arc::new(SqliteVectorStore::new(pool));
    let embedder = Arc::new(HashEmbedder::new(cfg.embedding.dims));
    let dispatcher = Arc::new(LocalDispatcher::new(
        index.clone(),
        Arc::clone(&vectors) as Arc<dyn kbase::vector::VectorStore>,
        Arc::clone(&embedder) as Arc<dyn kbase::embedding::Embedder>,
        cfg.ingestion.max_tokens,
    ));
    let manager = Arc::new(KnowledgeManager::new(
        index,
        blobs,
        vectors,
        embedder,
        Arc::clone(&dispatcher) as Arc<dyn kbase::ingest::IngestionDispatcher>,
    ));
    let directory = Arc::new(ConfigUserDirectory::from_config(cfg));
    let policy = AccessPolicy::for_request(manager, directory, identity).await?;
    Ok(App { policy, dispatcher })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg.db.path).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let identity = match cli.identity {
        Some(username) => Identity::User(username),
        None => Identity::Anonymous,
    };
    let app = build_app(&cfg, identity).await?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Add { file, content_type } => {
            let bytes = std::fs::read(&file)?;
            let file_name = file_name_of(&file);
            let content_type = content_type.unwrap_or_else(|| detect_content_type(&file));
            let id = app.policy.add_source(&bytes, &file_name, &content_type).await?;
            app.dispatcher.drain().await;
            let knowledge = app.policy.get_knowledge(&id).await?;
            println!("Added {} ({})", id, knowledge.status.as_str());
        }
        Commands::List => {
            let entries = app.policy.get_all_knowledge().await?;
            if entries.is_empty() {
                println!("No knowledge entries visible.");
            }
            for k in entries {
                print_row(&k);
            }
        }
        Commands::Show { id } => {
            let k = app.policy.get_knowledge(&id).await?;
            print_detail(&k);
        }
        Commands::Fetch { id, output } => {
            let (file_name, bytes, _metadata) = app.policy.get_file(&id).await?;
            let target = output.unwrap_or_else(|| PathBuf::from(&file_name));
            std::fs::write(&target, &bytes)?;
            println!("Wrote {} bytes to {}", bytes.len(), target.display());
        }
        Commands::Update {
            id,
            file,
            content_type,
        } => {
            let bytes = std::fs::read(&file)?;
            let file_name = file_name_of(&file);
            let content_type = content_type.unwrap_or_else(|| detect_content_type(&file));
            app.policy
                .update_source(&id, &bytes, &file_name, &content_type)
                .await?;
            app.dispatcher.drain().await;
            let knowledge = app.policy.get_knowledge(&id).await?;
            println!("Updated {} ({})", id, knowledge.status.as_str());
        }
        Commands::Delete { id } => {
            app.policy.delete_knowledge(&id).await?;
            println!("Deleted {}", id);
        }
        Commands::Retry { id } => {
            app.policy.retry_failed_ingestion(&id).await?;
            app.dispatcher.drain().await;
            let knowledge = app.policy.get_knowledge(&id).await?;
            println!("Retried {} ({})", id, knowledge.status.as_str());
        }
        Commands::Grant {
            id,
            username,
            permission,
        } => {
            let permission = Permission::from_str(&permission)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            app.policy.set_permission(&id, &username, permission).await?;
            println!("Granted {} to {} on {}", permission, username, id);
        }
        Commands::Revoke { id, username } => {
            app.policy.remove_permission(&id, &username).await?;
            println!("Revoked {}'s access to {}", username, id);
        }
        Commands::Tag { id, tag } => {
            app.policy.add_tag(&id, &tag).await?;
            println!("Tagged {} with '{}'", id, tag);
        }
        Commands::Untag { id, tag } => {
            app.policy.remove_tag(&id, &tag).await?;
            println!("Removed tag '{}' from {}", tag, id);
        }
        Commands::Label { id, label } => {
            app.policy.set_label(&id, label.as_deref()).await?;
            match label {
                Some(label) => println!("Labeled {} as '{}'", id, label),
                None => println!("Cleared label of {}", id),
            }
        }
        Commands::Search { query, limit } => {
            let hits = app.policy.search(&query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for hit in hits {
                println!(
                    "{:.4}  {}  {}",
                    hit.score,
                    hit.knowledge_id,
                    hit.snippet.replace('\n', " ")
                );
            }
        }
    }

    // Make sure any in-flight ingestion settles before the process exits.
    app.dispatcher.drain().await;
    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

fn detect_content_type(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "text" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn print_row(k: &Knowledge) {
    println!(
        "{}  {:<9}  {:>6}  {}",
        k.id,
        k.status.as_str(),
        k.token_count.map(|t| t.to_string()).unwrap_or_default(),
        k.display_name()
    );
}

fn print_detail(k: &Knowledge) {
    println!("id:            {}", k.id);
    println!("label:         {}", k.label.as_deref().unwrap_or("-"));
    println!("file:          {}", k.source.file_name());
    println!("content type:  {}", k.content_type);
    println!("checksum:      {}", k.checksum);
    println!("status:        {}", k.status.as_str());
    println!(
        "token count:   {}",
        k.token_count.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "tags:          {}",
        if k.tags.is_empty() {
            "-".to_string()
        } else {
            k.tags.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    );
    println!("permissions:");
    if k.permissions.is_empty() {
        println!("  (none)");
    }
    for (username, permission) in &k.permissions {
        println!("  {:<16} {}", username, permission);
    }
}
