pub mod add_project;
pub mod analyze_stars;
pub mod list_images;
pub mod list_projects;
pub mod read_header;
pub mod sync_project;
pub mod watch_project;

pub use add_project::{add_project, set_project_status};
pub use analyze_stars::analyze_stars;
pub use list_images::list_images;
pub use list_projects::list_projects;
pub use read_header::read_header;
pub use sync_project::sync_project;
pub use watch_project::watch_project;
