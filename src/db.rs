use crate::models::{CatalogRecord, FrameMeasurement, Project, ProjectStatus, DATE_FORMAT};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    base_dir TEXT NOT NULL,
    date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object TEXT NOT NULL DEFAULT '',
    date_obs TEXT NOT NULL DEFAULT '1970-01-01T00:00:00',
    filter TEXT NOT NULL DEFAULT '',
    exposure REAL NOT NULL DEFAULT 0,
    ccd_temp REAL NOT NULL DEFAULT 0,
    imagetyp TEXT NOT NULL DEFAULT '',
    xbinning INTEGER NOT NULL DEFAULT 1,
    ra REAL NOT NULL DEFAULT 0,
    dec REAL NOT NULL DEFAULT 0,
    alt REAL NOT NULL DEFAULT 0,
    az REAL NOT NULL DEFAULT 0,
    gain INTEGER NOT NULL DEFAULT 0,
    offset INTEGER NOT NULL DEFAULT 0,
    fwhm REAL NOT NULL DEFAULT 0,
    eccentricity REAL NOT NULL DEFAULT 0,
    file TEXT NOT NULL,
    size REAL NOT NULL DEFAULT 0,
    mean REAL NOT NULL DEFAULT 0,
    median REAL NOT NULL DEFAULT 0,
    std REAL NOT NULL DEFAULT 0,
    site_lat REAL NOT NULL DEFAULT 0,
    site_long REAL NOT NULL DEFAULT 0,
    moon_phase REAL NOT NULL DEFAULT 0,
    moon_separation REAL NOT NULL DEFAULT 0,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    UNIQUE(project_id, file)
);

CREATE INDEX IF NOT EXISTS idx_images_project ON images(project_id);
";

const RECORD_COLUMNS: &str = "object, date_obs, filter, exposure, ccd_temp, imagetyp, xbinning,
     ra, dec, alt, az, gain, offset, fwhm, eccentricity, file, size, mean, median, std,
     site_lat, site_long, moon_phase, moon_separation, project_id";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("file already cataloged in project {project_id}: {file}")]
    Duplicate { project_id: i64, file: String },
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Catalog persistence used by the sync orchestrator
pub trait CatalogStore {
    fn insert(&self, record: &CatalogRecord) -> Result<i64, CatalogError>;
    fn query_known_files(&self, project_id: i64) -> Result<HashSet<String>, CatalogError>;
    fn delete_by_project(&self, project_id: i64) -> Result<usize, CatalogError>;
    fn delete_by_path(&self, project_id: i64, path: &str) -> Result<usize, CatalogError>;
    /// Remove several paths at once; either all go or none do
    fn delete_paths(&self, project_id: i64, paths: &[String]) -> Result<usize, CatalogError>;
    fn count_by_project(&self, project_id: i64) -> Result<usize, CatalogError>;
    fn get_project(&self, project_id: i64) -> Result<Option<Project>, CatalogError>;
}

/// SQLite catalog
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize catalog schema")?;
        Ok(Database { conn })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // Project queries
    pub fn create_project(&self, name: &str, base_dir: &str) -> Result<i64> {
        let date = chrono::Local::now().naive_local().format(DATE_FORMAT).to_string();
        self.conn
            .execute(
                "INSERT INTO projects (name, base_dir, date, status) VALUES (?, ?, ?, 'active')",
                params![name, base_dir, date],
            )
            .with_context(|| format!("Failed to create project '{}'", name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_project_status(&self, project_id: i64, status: ProjectStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE projects SET status = ? WHERE id = ?",
            params![status.as_str(), project_id],
        )?;
        anyhow::ensure!(updated == 1, "Project {} not found", project_id);
        Ok(())
    }

    pub fn get_all_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, base_dir, date, status
             FROM projects
             ORDER BY name",
        )?;

        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    pub fn find_project_id_by_name(&self, name: &str) -> Result<i64> {
        let mut stmt = self.conn.prepare("SELECT id FROM projects WHERE name = ?")?;
        stmt.query_row([name], |row| row.get(0))
            .with_context(|| format!("Project '{}' not found", name))
    }

    /// Resolve a project given as name or, failing that, numeric id
    pub fn resolve_project(&self, project: &str) -> Result<i64> {
        if let Ok(id) = self.find_project_id_by_name(project) {
            return Ok(id);
        }
        match project.parse::<i64>() {
            Ok(id) => Ok(id),
            Err(_) => anyhow::bail!("Project '{}' not found", project),
        }
    }

    // Image queries
    pub fn records_by_project(&self, project_id: i64) -> Result<Vec<CatalogRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images WHERE project_id = ? ORDER BY date_obs, file",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map([project_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    // Transaction helpers
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl CatalogStore for Database {
    fn insert(&self, record: &CatalogRecord) -> Result<i64, CatalogError> {
        let m = &record.measurement;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO images ({}) VALUES
                 (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RECORD_COLUMNS
            ),
            params![
                record.object.as_deref().unwrap_or(""),
                record.date_string(),
                record.filter.as_deref().unwrap_or(""),
                record.exposure.unwrap_or(0.0),
                record.ccd_temp.unwrap_or(0.0),
                record.frame_type.as_deref().unwrap_or(""),
                record.binning.unwrap_or(1),
                record.ra.unwrap_or(0.0),
                record.dec.unwrap_or(0.0),
                record.alt.unwrap_or(0.0),
                record.az.unwrap_or(0.0),
                record.gain.unwrap_or(0),
                record.offset.unwrap_or(0),
                m.fwhm,
                m.eccentricity,
                record.file,
                record.size_mb,
                m.mean,
                m.median,
                m.std,
                record.site_lat.unwrap_or(0.0),
                record.site_long.unwrap_or(0.0),
                record.moon_phase,
                record.moon_separation,
                record.project_id,
            ],
        );

        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(CatalogError::Duplicate {
                project_id: record.project_id,
                file: record.file.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn query_known_files(&self, project_id: i64) -> Result<HashSet<String>, CatalogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT file FROM images WHERE project_id = ?")?;
        let files = stmt
            .query_map([project_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(files)
    }

    fn delete_by_project(&self, project_id: i64) -> Result<usize, CatalogError> {
        Ok(self
            .conn
            .execute("DELETE FROM images WHERE project_id = ?", [project_id])?)
    }

    fn delete_by_path(&self, project_id: i64, path: &str) -> Result<usize, CatalogError> {
        Ok(self.conn.execute(
            "DELETE FROM images WHERE project_id = ? AND file = ?",
            params![project_id, path],
        )?)
    }

    fn delete_paths(&self, project_id: i64, paths: &[String]) -> Result<usize, CatalogError> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|tx| -> Result<usize, CatalogError> {
            let mut stmt = tx.prepare("DELETE FROM images WHERE project_id = ? AND file = ?")?;
            let mut deleted = 0;
            for path in paths {
                deleted += stmt.execute(params![project_id, path])?;
            }
            Ok(deleted)
        })
    }

    fn count_by_project(&self, project_id: i64) -> Result<usize, CatalogError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM images WHERE project_id = ?",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_project(&self, project_id: i64) -> Result<Option<Project>, CatalogError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, base_dir, date, status FROM projects WHERE id = ?",
                [project_id],
                project_from_row,
            )
            .optional()?)
    }
}

fn project_from_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        base_dir: row.get(2)?,
        date: row.get(3)?,
        status: ProjectStatus::from_db(&row.get::<_, String>(4)?),
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Stored values come back as-is; only empty text maps to `None`
fn record_from_row(row: &Row) -> rusqlite::Result<CatalogRecord> {
    let date: String = row.get(1)?;
    Ok(CatalogRecord {
        object: non_empty(row.get(0)?),
        date_obs: NaiveDateTime::parse_from_str(&date, DATE_FORMAT).ok(),
        filter: non_empty(row.get(2)?),
        exposure: Some(row.get(3)?),
        ccd_temp: Some(row.get(4)?),
        frame_type: non_empty(row.get(5)?),
        binning: Some(row.get(6)?),
        ra: Some(row.get(7)?),
        dec: Some(row.get(8)?),
        alt: Some(row.get(9)?),
        az: Some(row.get(10)?),
        gain: Some(row.get(11)?),
        offset: Some(row.get(12)?),
        measurement: FrameMeasurement {
            fwhm: row.get(13)?,
            eccentricity: row.get(14)?,
            mean: row.get(17)?,
            median: row.get(18)?,
            std: row.get(19)?,
        },
        file: row.get(15)?,
        size_mb: row.get(16)?,
        site_lat: Some(row.get(20)?),
        site_long: Some(row.get(21)?),
        moon_phase: row.get(22)?,
        moon_separation: row.get(23)?,
        project_id: row.get(24)?,
    })
}
