use crate::db::Database;
use crate::models::ProjectStatus;
use anyhow::{Context, Result};
use std::path::Path;

pub fn add_project(db: &Database, name: &str, base_dir: &str) -> Result<()> {
    let path = Path::new(base_dir);
    if !path.is_dir() {
        return Err(anyhow::anyhow!(
            "Base directory does not exist or is not accessible: {}",
            path.display()
        ));
    }
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    let id = db.create_project(name, &absolute.to_string_lossy())?;
    println!("Created project '{}' (ID {}) at {}", name, id, absolute.display());
    Ok(())
}

pub fn set_project_status(db: &Database, project: &str, status: &str) -> Result<()> {
    let status = match status.to_lowercase().as_str() {
        "active" => ProjectStatus::Active,
        "archived" => ProjectStatus::Archived,
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid status: {}. Use active or archived",
                status
            ))
        }
    };

    let project_id = db.resolve_project(project)?;
    db.set_project_status(project_id, status)?;
    println!("Project {} is now {}", project_id, status.as_str());
    Ok(())
}
