use crate::db::{CatalogStore, Database};
use crate::utils::truncate_string;
use anyhow::Result;

pub fn list_projects(db: &Database) -> Result<()> {
    let projects = db.get_all_projects()?;

    println!(
        "{:<8} {:<30} {:<10} {:<8} {:<20} {:<40}",
        "ID", "Name", "Status", "Images", "Created", "Base Directory"
    );
    println!("{:-<120}", "");

    for project in projects {
        let images = db.count_by_project(project.id)?;
        println!(
            "{:<8} {:<30} {:<10} {:<8} {:<20} {:<40}",
            project.id,
            truncate_string(&project.name, 30),
            project.status.as_str(),
            images,
            project.date,
            truncate_string(&project.base_dir, 40)
        );
    }

    Ok(())
}
