use crate::astrometry::format_sexagesimal;
use crate::config::{AngleUnit, CatalogConfig};
use crate::fits::{format_header, read_header as read_fits_header};
use crate::header::HeaderExtractor;
use crate::models::CatalogRecord;
use crate::scanner::PathScanner;
use anyhow::Result;
use std::path::Path;
use tracing::error;

pub fn read_header(config: &CatalogConfig, path: &str, raw: bool, format: &str) -> Result<()> {
    let path = Path::new(path);
    let extractor = HeaderExtractor::new(config.keywords.clone());

    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        let report = PathScanner::new(&config.extensions).scan(path);
        if report.files.is_empty() {
            println!("No FITS files found in {}", path.display());
            return Ok(());
        }
        report.files
    } else {
        return Err(anyhow::anyhow!(
            "Path does not exist or is not accessible: {}",
            path.display()
        ));
    };

    let mut records = Vec::with_capacity(files.len());
    for file in &files {
        match extractor.extract(file, 0) {
            Ok(record) => {
                if format != "json" {
                    if raw {
                        let header = read_fits_header(file)?;
                        print!("{}", format_header(&file.display().to_string(), &header, true));
                    }
                    print_record(&record);
                    println!();
                }
                records.push(record);
            }
            Err(e) => error!("{}: {:#}", file.display(), e),
        }
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if files.len() > 1 {
        println!("Read {} of {} files", records.len(), files.len());
    }

    Ok(())
}

fn print_record(r: &CatalogRecord) {
    let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let num = |v: Option<f64>| v.map(|x| format!("{:.4}", x)).unwrap_or_else(|| "-".to_string());
    let int = |v: Option<i64>| v.map(|x| x.to_string()).unwrap_or_else(|| "-".to_string());
    let angle = |v: Option<f64>, unit| {
        v.map(|x| format!("{:.4} ({})", x, format_sexagesimal(x, unit)))
            .unwrap_or_else(|| "-".to_string())
    };

    println!("File: {} ({:.2} MB)", r.file, r.size_mb);
    println!("  {:<16} {}", "Object", text(&r.object));
    println!("  {:<16} {}", "Date", r.date_string());
    println!("  {:<16} {}", "Filter", text(&r.filter));
    println!("  {:<16} {}", "Exposure", num(r.exposure));
    println!("  {:<16} {}", "CCD temp", num(r.ccd_temp));
    println!("  {:<16} {}", "Frame type", text(&r.frame_type));
    println!("  {:<16} {}", "Binning", int(r.binning));
    println!("  {:<16} {}", "Gain", int(r.gain));
    println!("  {:<16} {}", "Offset", int(r.offset));
    println!("  {:<16} {}", "RA", angle(r.ra, AngleUnit::Hours));
    println!("  {:<16} {}", "Dec", angle(r.dec, AngleUnit::Degrees));
    println!("  {:<16} {}", "Alt", num(r.alt));
    println!("  {:<16} {}", "Az", num(r.az));
    println!("  {:<16} {}", "Site lat", num(r.site_lat));
    println!("  {:<16} {}", "Site long", num(r.site_long));
    println!("  {:<16} {:.2}", "Moon phase", r.moon_phase);
    println!("  {:<16} {:.2}", "Moon sep", r.moon_separation);
}
