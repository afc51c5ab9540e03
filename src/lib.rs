pub mod astrometry;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod fits;
pub mod header;
pub mod image_analysis;
pub mod models;
pub mod photometry;
pub mod psf_fitting;
pub mod scanner;
pub mod star_detection;
pub mod sync;
pub mod utils;
pub mod watch;

#[cfg(test)]
mod test_sync;
#[cfg(test)]
mod test_utils;

// Re-export commonly used items
pub use config::CatalogConfig;
pub use db::{CatalogError, CatalogStore, Database};
pub use image_analysis::FitsImage;
pub use models::{CatalogRecord, FrameMeasurement, Project, ProjectStatus};
pub use photometry::PhotometricAnalyzer;
pub use sync::{SyncEvent, SyncJob, SyncRegistry, Synchronizer};
