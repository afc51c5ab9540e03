use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "exposure-catalog")]
#[command(about = "Catalog astrophotography exposures with header metadata and star quality", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "catalog.sqlite")]
    pub database: String,

    /// JSON configuration file (keyword aliases, extensions, analyzer settings)
    #[arg(long)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize a project's catalog with its image folder
    Sync {
        /// Project ID or name
        project: String,

        /// Drop the project's catalog and rebuild it from scratch
        #[arg(long)]
        resync: bool,

        /// Only process these files instead of walking the project folder
        #[arg(short, long = "file")]
        files: Vec<String>,

        /// Use this folder instead of the project's base directory
        #[arg(long)]
        base_dir: Option<String>,
    },

    /// Keep watching a project's folder and catalog new images as they arrive
    Watch {
        /// Project ID or name
        project: String,

        /// Seconds without file activity before a batch of new files is synced
        #[arg(long, default_value_t = 2.0)]
        settle: f64,
    },

    /// Detect and measure stars in a single FITS file
    Analyze {
        /// Path to the FITS file
        fits_path: String,

        #[command(flatten)]
        options: AnalyzerOptions,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the catalog record a FITS file would produce, without storing it
    ReadHeader {
        /// Path to a FITS file or a directory of FITS files
        path: String,

        /// Also print every raw header card
        #[arg(long)]
        raw: bool,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List all projects
    ListProjects,

    /// Create a project
    AddProject {
        name: String,

        /// Folder holding the project's images
        base_dir: String,
    },

    /// Mark a project archived (read-only) or active again
    SetStatus {
        /// Project ID or name
        project: String,

        /// active or archived
        status: String,
    },

    /// List cataloged images of a project
    ListImages {
        /// Project ID or name
        project: String,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Analyzer overrides; unset values come from the configuration
#[derive(Debug, Clone, Default, clap::Args)]
pub struct AnalyzerOptions {
    /// Keep the central 1/N of each image dimension
    #[arg(long)]
    pub crop: Option<usize>,

    /// Number of brightest stars to fit
    #[arg(long)]
    pub stars: Option<usize>,

    /// Detection threshold in background standard deviations
    #[arg(long)]
    pub threshold: Option<f64>,

    #[arg(long)]
    pub bit_depth: Option<u32>,

    #[arg(long)]
    pub binning: Option<usize>,

    /// Aperture radius in unbinned pixels
    #[arg(long)]
    pub radius: Option<usize>,

    /// Saturation limit as a percentage of full scale
    #[arg(long)]
    pub saturation: Option<f64>,
}

impl AnalyzerOptions {
    pub fn apply(&self, settings: &mut crate::config::AnalyzerSettings) {
        if let Some(v) = self.crop {
            settings.crop_factor = v;
        }
        if let Some(v) = self.stars {
            settings.max_stars = v;
        }
        if let Some(v) = self.threshold {
            settings.threshold = v;
        }
        if let Some(v) = self.bit_depth {
            settings.bit_depth = v;
        }
        if let Some(v) = self.binning {
            settings.binning = v;
        }
        if let Some(v) = self.radius {
            settings.radius = v;
        }
        if let Some(v) = self.saturation {
            settings.saturation_limit = v;
        }
    }
}
