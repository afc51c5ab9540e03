use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use exposure_catalog::cli::{Cli, Commands};
use exposure_catalog::commands;
use exposure_catalog::config::CatalogConfig;
use exposure_catalog::db::Database;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = CatalogConfig::load_or_default(cli.config.as_deref().map(Path::new))?;
    let database = Path::new(&cli.database);

    match cli.command {
        Commands::Sync {
            project,
            resync,
            files,
            base_dir,
        } => {
            commands::sync_project(database, &config, &project, resync, files, base_dir)?;
        }
        Commands::Watch { project, settle } => {
            commands::watch_project(database, &config, &project, settle)?;
        }
        Commands::Analyze {
            fits_path,
            options,
            format,
        } => {
            let mut settings = config.analyzer.clone();
            options.apply(&mut settings);
            commands::analyze_stars(&fits_path, settings, &format)?;
        }
        Commands::ReadHeader { path, raw, format } => {
            commands::read_header(&config, &path, raw, &format)?;
        }
        Commands::ListProjects => {
            commands::list_projects(&Database::open(database)?)?;
        }
        Commands::AddProject { name, base_dir } => {
            commands::add_project(&Database::open(database)?, &name, &base_dir)?;
        }
        Commands::SetStatus { project, status } => {
            commands::set_project_status(&Database::open(database)?, &project, &status)?;
        }
        Commands::ListImages { project, format } => {
            commands::list_images(&Database::open(database)?, &project, &format)?;
        }
    }

    Ok(())
}
