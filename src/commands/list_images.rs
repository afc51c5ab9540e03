use crate::db::Database;
use crate::models::CatalogRecord;
use crate::utils::{escape_csv, truncate_string};
use anyhow::Result;
use std::path::Path;

pub fn list_images(db: &Database, project: &str, format: &str) -> Result<()> {
    let project_id = db.resolve_project(project)?;
    let records = db.records_by_project(project_id)?;

    match format {
        "json" => output_json(&records)?,
        "csv" => output_csv(&records),
        _ => output_table(&records),
    }

    Ok(())
}

fn file_name(record: &CatalogRecord) -> String {
    Path::new(&record.file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| record.file.clone())
}

fn output_table(records: &[CatalogRecord]) {
    println!(
        "{:<40} {:<20} {:<20} {:<6} {:>8} {:>6} {:>7} {:>7} {:>8} {:>6}",
        "Filename", "Object", "Date", "Filter", "Exposure", "Alt", "FWHM", "Ecc", "Median", "Moon"
    );
    println!("{:-<140}", "");

    for record in records {
        println!(
            "{:<40} {:<20} {:<20} {:<6} {:>8.1} {:>6.1} {:>7.2} {:>7.2} {:>8.1} {:>6.2}",
            truncate_string(&file_name(record), 40),
            truncate_string(record.object.as_deref().unwrap_or(""), 20),
            record.date_string(),
            truncate_string(record.filter.as_deref().unwrap_or(""), 6),
            record.exposure.unwrap_or(0.0),
            record.alt.unwrap_or(0.0),
            record.measurement.fwhm,
            record.measurement.eccentricity,
            record.measurement.median,
            record.moon_phase
        );
    }

    println!("\nTotal: {} images", records.len());
}

fn output_json(records: &[CatalogRecord]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(records)?);
    Ok(())
}

fn output_csv(records: &[CatalogRecord]) {
    println!(
        "file,object,date_obs,filter,exposure,ccd_temp,imagetyp,xbinning,ra,dec,alt,az,gain,offset,\
         fwhm,eccentricity,mean,median,std,size,site_lat,site_long,moon_phase,moon_separation"
    );

    let num = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    let int = |v: Option<i64>| v.map(|x| x.to_string()).unwrap_or_default();

    for r in records {
        let m = &r.measurement;
        println!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            escape_csv(&r.file),
            escape_csv(r.object.as_deref().unwrap_or("")),
            r.date_string(),
            escape_csv(r.filter.as_deref().unwrap_or("")),
            num(r.exposure),
            num(r.ccd_temp),
            escape_csv(r.frame_type.as_deref().unwrap_or("")),
            int(r.binning),
            num(r.ra),
            num(r.dec),
            num(r.alt),
            num(r.az),
            int(r.gain),
            int(r.offset),
            m.fwhm,
            m.eccentricity,
            m.mean,
            m.median,
            m.std,
            r.size_mb,
            num(r.site_lat),
            num(r.site_long),
            r.moon_phase,
            r.moon_separation
        );
    }
}
