//! trackersync - Azure DevOps work-item sync
//!
//! Main entry point for the trackersync CLI.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use trackersync::app::App;
use trackersync::config::SyncConfig;
use trackersync::devops::models::{STATE_FIELD, TITLE_FIELD};
use trackersync::store::{ConnectionSummary, JobType, SyncJob};
use trackersync::vault::{crypto, Requester};
use trackersync::SyncError;

/// trackersync - Bidirectional sync with Azure DevOps work items
#[derive(Parser, Debug)]
#[command(name = "trackersync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/trackersync/config.yaml)
    #[arg(short, long, env = "TRACKERSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// OAuth application (client) id
        #[arg(long)]
        client_id: String,

        /// Redirect URI registered for the application
        #[arg(long)]
        redirect_uri: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Generate a base64 AES-256 key for token encryption
    GenKey,

    /// Run the HTTP API
    Serve {
        /// Listen address (default: server.bind from the config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Print the tracker authorize URL for a tenant
    AuthorizeUrl {
        /// Organization URL (e.g., https://dev.azure.com/contoso)
        #[arg(long)]
        org_url: String,

        /// Project name
        #[arg(long)]
        project: String,

        #[arg(long, env = "TRACKERSYNC_TENANT")]
        tenant: String,

        #[arg(long, env = "TRACKERSYNC_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// List connections for a tenant
    Connections {
        #[arg(long, env = "TRACKERSYNC_TENANT")]
        tenant: String,
    },

    /// Show the field mappings of a connection
    Mappings {
        /// Connection id
        connection: i64,
    },

    /// Run a sync job in the foreground
    Sync {
        /// Connection id
        connection: i64,

        /// Job type (full_sync, incremental_sync, manual_sync)
        #[arg(short, long, default_value = "manual_sync")]
        job_type: String,

        #[arg(long, env = "TRACKERSYNC_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Show a sync job
    Job {
        /// Job id
        id: i64,
    },

    /// Show the revision history of a work item
    History {
        /// Connection id
        connection: i64,

        /// Work item id
        item: i64,

        /// Only revisions changed at or after this RFC3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    if let Err(e) = trackersync::logging::init(default_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        if e.is_fatal() {
            eprintln!("Hint: re-authorize the tracker connection");
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> trackersync::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(SyncConfig::default_path);

    // Commands that need no configuration
    match cli.command {
        Commands::GenKey => {
            println!("{}", crypto::encode_key(&crypto::generate_key()));
            return Ok(());
        }
        Commands::Init {
            ref client_id,
            ref redirect_uri,
            force,
        } => return handle_init(&config_path, client_id, redirect_uri, force),
        _ => {}
    }

    let config = SyncConfig::load(&config_path)?;
    let secrets = config.resolve_secrets()?;
    let app = App::build(config, &secrets)?;

    match cli.command {
        Commands::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| app.config.server.bind.clone());
            app.server().run(&addr).await
        }

        Commands::AuthorizeUrl {
            org_url,
            project,
            tenant,
            actor,
        } => {
            let url = app
                .vault
                .build_authorization_url(&org_url, &project, &Requester::new(tenant, actor))?;
            println!("{}", url);
            Ok(())
        }

        Commands::Connections { tenant } => {
            let connections = app.store.list_connections(&tenant).await?;
            if connections.is_empty() {
                println!("No connections for tenant {}", tenant);
                return Ok(());
            }
            for connection in connections.iter().map(ConnectionSummary::from) {
                println!(
                    "{:>4}  {}  {}  (token expires {})",
                    connection.id,
                    connection.org_url,
                    connection.project,
                    connection.token_expires_at.format("%Y-%m-%d %H:%M UTC")
                );
            }
            Ok(())
        }

        Commands::Mappings { connection } => {
            app.store.get_connection(connection).await?;
            let mappings = app.orchestrator.mappings().get_mappings(connection).await?;
            if mappings.is_empty() {
                println!("No mappings yet; defaults are installed on the first sync");
                return Ok(());
            }
            for m in mappings {
                let transform = m.transform.map(|t| t.to_string()).unwrap_or_default();
                println!(
                    "{:<10} {:<40} -> {:<12} {:<9} {:<24} {}",
                    m.entity_type.as_str(),
                    m.external_field,
                    m.internal_field,
                    m.mapping_type.as_str(),
                    transform,
                    m.direction.as_str()
                );
            }
            Ok(())
        }

        Commands::Sync {
            connection,
            job_type,
            actor,
        } => {
            let job_type: JobType = job_type.parse()?;
            let job_id = app
                .orchestrator
                .create_job(connection, job_type, &actor)
                .await?;
            let job = app.orchestrator.run_job(job_id).await?;
            print_job(&job);
            Ok(())
        }

        Commands::Job { id } => {
            let job = app.orchestrator.get_job(id).await?;
            print_job(&job);
            Ok(())
        }

        Commands::History {
            connection,
            item,
            since,
        } => {
            let since = since
                .map(|s| {
                    DateTime::parse_from_rfc3339(&s)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| SyncError::Validation(format!("Invalid --since: {}", e)))
                })
                .transpose()?;
            let revisions = app.tracker.revisions_since(connection, item, since).await?;
            if revisions.is_empty() {
                println!("No revisions");
            }
            for revision in revisions {
                let text = |name: &str| {
                    revision
                        .field(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or("-")
                        .to_string()
                };
                println!(
                    "rev {:>3}  {}  [{}] {}",
                    revision.rev,
                    revision
                        .changed_date()
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    text(STATE_FIELD),
                    text(TITLE_FIELD)
                );
            }
            Ok(())
        }

        Commands::GenKey | Commands::Init { .. } => Ok(()),
    }
}

fn handle_init(
    path: &Path,
    client_id: &str,
    redirect_uri: &str,
    force: bool,
) -> trackersync::Result<()> {
    if path.exists() && !force {
        return Err(SyncError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let config = SyncConfig::new(client_id, redirect_uri);
    config.save(path)?;

    println!("Wrote {}", path.display());
    println!();
    println!("Next steps:");
    println!(
        "  export {}=$(trackersync gen-key)",
        config.encryption_key_env
    );
    println!("  export {}=<client secret>", config.oauth.client_secret_env);
    println!("  trackersync serve");
    Ok(())
}

fn print_job(job: &SyncJob) {
    println!(
        "Job {} ({}) on connection {}: {}",
        job.id,
        job.job_type.as_str(),
        job.connection_id,
        job.status.as_str()
    );
    if let Some(started) = job.started_at {
        println!("  started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  completed: {}", completed.to_rfc3339());
    }
    println!("  items synced: {}", job.items_synced);
    if !job.errors.is_empty() {
        println!("  errors ({}):", job.errors.len());
        for error in &job.errors {
            println!("    - {}", error);
        }
    }
}
