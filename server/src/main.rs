//! SyncAgent coordination server (tangled)

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod config;
mod db;
mod storage;

use config::Config;

#[derive(Parser)]
#[command(name = "tangled")]
#[command(about = "SyncAgent coordination server daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (runs in background unless --foreground is given)
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the server
    Down,
    /// Show server status
    Status,
    /// Run database migrations
    Migrate,
    /// Reset database (drop all tables and data)
    Reset {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Mint a single-use invitation for a new machine to register with
    Invite,
    /// List and manage registered machines
    Machines {
        #[command(subcommand)]
        command: MachineCommands,
    },
}

#[derive(Subcommand)]
enum MachineCommands {
    /// List all registered machines
    List,
    /// Revoke a machine's tokens and remove it
    Remove {
        /// Machine id
        id: i64,
    },
}

fn pid_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tangled.pid")
}

fn is_server_running() -> Option<u32> {
    let pid_path = pid_file();
    if pid_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                #[cfg(unix)]
                {
                    let result = Command::new("kill")
                        .args(["-0", &pid.to_string()])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status();
                    if result.map(|s| s.success()).unwrap_or(false) {
                        return Some(pid);
                    }
                }
                #[cfg(not(unix))]
                {
                    return Some(pid);
                }
            }
        }
        let _ = fs::remove_file(&pid_path);
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Down => return stop_server(),
        Commands::Status => return show_status().await,
        Commands::Serve { foreground } if !foreground => return start_daemon(),
        _ => {}
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tangled=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { foreground: _ } => run_server(config).await?,
        Commands::Down | Commands::Status => unreachable!(),
        Commands::Migrate => run_migrations(&config).await?,
        Commands::Reset { force } => reset_database(&config, force).await?,
        Commands::Invite => create_invitation(&config).await?,
        Commands::Machines { command } => match command {
            MachineCommands::List => list_machines(&config).await?,
            MachineCommands::Remove { id } => remove_machine(&config, id).await?,
        },
    }

    Ok(())
}

fn start_daemon() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        println!("tangled already running (pid {})", pid);
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    let child = Command::new(&exe)
        .args(["serve", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let pid = child.id();

    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, pid.to_string())?;

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    println!("tangled serving on localhost:{}", config.http_port);
    println!("pid: {}", pid);

    Ok(())
}

fn stop_server() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        #[cfg(unix)]
        {
            Command::new("kill").args([&pid.to_string()]).status()?;
        }
        #[cfg(not(unix))]
        {
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .status()?;
        }

        let _ = fs::remove_file(pid_file());
        println!("tangled stopped");
    } else {
        println!("tangled not running");
    }
    Ok(())
}

async fn show_status() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match is_server_running() {
        Some(pid) => {
            println!("tangled running");
            println!("  pid: {}", pid);
            println!("  http: localhost:{}", config.http_port);

            if let Ok(pool) = db::create_pool(&config.database_url).await {
                if let Ok(stats) = db::get_stats(&pool).await {
                    println!("  machines: {}", stats.total_machines);
                    println!("  files: {}", stats.total_files);
                    println!("  change log entries: {}", stats.total_change_log_entries);
                    println!("  total bytes (logical): {}", stats.total_bytes);
                }
            }
            if let Ok(blob_store) = storage::BlobStore::new(&config.blob_storage_path) {
                if let Ok(blob_bytes) = blob_store.total_size() {
                    println!("  total bytes (blob store, post-dedup): {}", blob_bytes);
                }
            }
        }
        None => println!("tangled not running"),
    }
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;

    let db_pool = db::create_pool(&config.database_url).await?;

    tracing::info!("checking database migrations...");
    if let Err(e) = db::run_migrations(&db_pool).await {
        let err_str = e.to_string();
        if !err_str.contains("already exists") {
            tracing::warn!("migration warning: {}", err_str);
        }
    }

    fs::create_dir_all(&config.blob_storage_path)?;
    let blob_store = storage::BlobStore::new(&config.blob_storage_path)?;
    let hub = api::SyncHub::default();

    let app_state = api::AppState::new(db_pool.clone(), blob_store, config.clone(), hub);

    tokio::spawn(run_trash_purge_loop(db_pool, config.trash_retention_days));

    let addr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let result = api::rest::serve(addr, app_state).await;

    let _ = fs::remove_file(pid_file());
    result
}

/// Sweeps soft-deleted file rows past their retention window (§4.3
/// `purge_trash`). Runs once a day; the GC policy is implementation-defined
/// per spec, so "keep forever, then purge on a daily cadence" is this
/// repo's choice.
async fn run_trash_purge_loop(pool: db::DbPool, retention_days: i64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
    loop {
        interval.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        match db::files::purge_trash(&pool, cutoff).await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "purged expired trash entries"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "trash purge failed"),
        }
    }
}

async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    println!("running migrations...");
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    println!("migrations complete");
    Ok(())
}

async fn create_invitation(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    // Minting an invitation is the first admin-originated mutation a fresh
    // server sees; materialize the reserved server machine row here rather
    // than in a migration (§9).
    db::machines::get_or_create_server_machine(&pool, &config.server_name).await?;
    let (raw, hash) = auth::generate_token();
    db::tokens::create_invitation(&pool, &hash).await?;

    println!("invitation token (share this with the new machine, it is shown only once):");
    println!("  {}", raw);
    Ok(())
}

async fn list_machines(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    let machines = db::machines::list_machines(&pool).await?;

    if machines.is_empty() {
        println!("no machines registered");
    } else {
        for m in machines {
            println!(
                "{}  {}  ({})  last seen: {}",
                m.id,
                m.name,
                m.platform,
                m.last_seen.to_rfc3339()
            );
        }
    }
    Ok(())
}

async fn remove_machine(config: &Config, id: i64) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::tokens::revoke_all_for_machine(&pool, id).await?;
    db::machines::delete_machine(&pool, id).await?;
    println!("machine {} removed", id);
    Ok(())
}

async fn reset_database(config: &Config, force: bool) -> anyhow::Result<()> {
    if !force {
        println!("this will DELETE ALL DATA.");
        println!("type 'yes' to confirm: ");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "yes" {
            println!("aborted");
            return Ok(());
        }
    }

    println!("resetting database...");
    let pool = db::create_pool(&config.database_url).await?;

    sqlx::query(
        "DELETE FROM change_log; \
         DELETE FROM file_chunks; \
         DELETE FROM files; \
         DELETE FROM invitations; \
         DELETE FROM tokens; \
         DELETE FROM machines;",
    )
    .execute(&pool)
    .await?;

    println!("database reset complete");

    Ok(())
}
