use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Result of walking a base directory
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Absolute paths of matching files, in walk order
    pub files: Vec<PathBuf>,
    /// Non-fatal problems met while walking
    pub errors: Vec<String>,
}

/// Recursive, case-insensitive discovery of image files by extension
#[derive(Debug, Clone)]
pub struct PathScanner {
    extensions: Vec<String>,
}

impl PathScanner {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }

    pub fn scan(&self, base_dir: &Path) -> ScanReport {
        let mut report = ScanReport::default();

        if !base_dir.is_dir() {
            let message = format!("Base directory not found: {}", base_dir.display());
            warn!("{}", message);
            report.errors.push(message);
            return report;
        }
        let base = std::path::absolute(base_dir).unwrap_or_else(|_| base_dir.to_path_buf());

        // Sorted per directory so repeated scans of an unchanged folder agree
        for entry in WalkDir::new(&base).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let message = format!("Error walking {}: {}", base.display(), e);
                    warn!("{}", message);
                    report.errors.push(message);
                    continue;
                }
            };

            if entry.file_type().is_file() && self.matches(entry.path()) {
                report.files.push(entry.into_path());
            }
        }

        debug!("Scanned {}: {} image files", base.display(), report.files.len());
        report
    }
}
