mod client;
mod config;
mod db;
mod models;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::client::{
    FileStorage, LocalStorage, ProjectDataManager, RemoteSettings, SaveOutcome,
    SelectedProjectRegistry, StorageMode,
};
use crate::models::{ProjectAggregate, ProjectHeader};
use crate::server::routing::{ConnectionParams, resolve};

#[derive(Parser)]
#[command(name = "site-log", version, about = "Construction-site project log with offline sync")]
struct Cli {
    /// Directory holding on-device project data and client settings
    #[arg(long, env = "SITE_LOG_DATA_DIR", default_value = ".site-log", global = true)]
    data_dir: PathBuf,

    /// Request timeout for the sync service, in seconds
    #[arg(long, env = "SITE_LOG_TIMEOUT_SECS", default_value_t = 10, global = true)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync service
    Serve,
    /// Create the tables in the fallback database
    Migrate,
    /// Show or switch the storage mode
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    /// Configure how to reach the sync service
    RemoteConfig {
        #[arg(long)]
        url: String,
        #[arg(long)]
        db_host: Option<String>,
        #[arg(long)]
        db_port: Option<u16>,
        #[arg(long)]
        db_name: Option<String>,
        #[arg(long)]
        db_user: Option<String>,
        #[arg(long)]
        db_password: Option<String>,
    },
    Projects {
        #[command(subcommand)]
        action: ProjectsAction,
    },
    /// The project all editors work on
    Select {
        #[command(subcommand)]
        action: SelectAction,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    Show,
    Local,
    Remote,
}

#[derive(Subcommand)]
enum ProjectsAction {
    List,
    Show {
        id: String,
    },
    Create {
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        city: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum SelectAction {
    Set { id: String },
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let config = config::init()?;
            server::serve(&config).await?;
        }
        Command::Migrate => {
            let config = config::init()?;
            let descriptor = resolve(&ConnectionParams::default(), &config.fallback_params())?;
            db::postgres::apply_schema(&descriptor)
                .await
                .with_context(|| format!("applying schema to {descriptor}"))?;
            println!("Schema applied to {descriptor}");
        }
        command => {
            let timeout = Duration::from_secs(cli.timeout_secs);
            run_client(&cli.data_dir, timeout, command).await?
        }
    }

    Ok(())
}

async fn run_client(data_dir: &Path, timeout: Duration, command: Command) -> Result<()> {
    let storage: Arc<dyn LocalStorage> = Arc::new(
        FileStorage::open(data_dir)
            .with_context(|| format!("opening data directory {}", data_dir.display()))?,
    );
    let manager = ProjectDataManager::new(storage.clone()).with_timeout(timeout);
    let registry = SelectedProjectRegistry::new(storage);

    match command {
        Command::Mode { action } => {
            let mode = match action {
                ModeAction::Show => manager.settings().mode()?,
                ModeAction::Local => StorageMode::Local,
                ModeAction::Remote => StorageMode::Remote,
            };
            manager.settings().set_mode(mode)?;
            println!("Storage mode: {mode}");
        }
        Command::RemoteConfig {
            url,
            db_host,
            db_port,
            db_name,
            db_user,
            db_password,
        } => {
            let remote = RemoteSettings {
                url,
                host: db_host,
                port: db_port,
                database: db_name,
                user: db_user,
                password: db_password,
            };
            manager.settings().set_remote(&remote)?;
            println!("Remote settings saved: {remote:?}");
        }
        Command::Projects { action } => match action {
            ProjectsAction::List => {
                let selected = registry.get()?.map(|s| s.id);
                for project in manager.load_all_projects().await? {
                    let marker = if selected.as_deref() == Some(project.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {}  {}  [{}]  {}",
                        project.id,
                        project.name,
                        project.status,
                        project.updated_at.to_rfc3339()
                    );
                }
            }
            ProjectsAction::Show { id } => match manager.load_project_data(&id).await? {
                Some(aggregate) => println!("{}", serde_json::to_string_pretty(&aggregate)?),
                None => bail!("project '{id}' not found"),
            },
            ProjectsAction::Create {
                name,
                id,
                description,
                city,
            } => {
                let mut header = ProjectHeader::new(name);
                if let Some(id) = id {
                    header.id = id;
                }
                header.description = description.unwrap_or_default();
                header.city = city.unwrap_or_default();
                let id = header.id.clone();

                let outcome = manager
                    .save_project_data(ProjectAggregate::new(header))
                    .await?;
                report_save(&id, &outcome);
            }
            ProjectsAction::Delete { id } => {
                manager.delete_project_data(&id).await?;
                if registry.is_selected(&id)? {
                    registry.clear()?;
                }
                println!("Deleted project {id}");
            }
        },
        Command::Select { action } => match action {
            SelectAction::Set { id } => {
                let summary = match manager
                    .load_all_projects()
                    .await?
                    .into_iter()
                    .find(|p| p.id == id)
                {
                    Some(summary) => summary,
                    None => match manager.load_project_data(&id).await? {
                        Some(aggregate) => aggregate.header.summary(),
                        None => bail!("project '{id}' not found"),
                    },
                };
                let selected = registry.set(&summary)?;
                println!("Selected {} ({})", selected.name, selected.id);
            }
            SelectAction::Show => match registry.get()? {
                Some(selected) => println!(
                    "{} ({}), selected {}",
                    selected.name,
                    selected.id,
                    selected.selected_at.to_rfc3339()
                ),
                None => println!("No project selected"),
            },
            SelectAction::Clear => {
                registry.clear()?;
                println!("Selection cleared");
            }
        },
        Command::Serve | Command::Migrate => unreachable!("handled before the client is opened"),
    }

    Ok(())
}

fn report_save(id: &str, outcome: &SaveOutcome) {
    match outcome {
        SaveOutcome::Saved(location) => println!("Saved project {id} ({location:?})"),
        SaveOutcome::SavedLocallyOnly { cause } => {
            println!("Saved project {id} locally only: {cause}")
        }
    }
}
