use crate::config::AnalyzerSettings;
use crate::photometry::{PhotometricAnalyzer, StarAnalysis};
use anyhow::Result;
use std::path::Path;

pub fn analyze_stars(fits_path: &str, settings: AnalyzerSettings, format: &str) -> Result<()> {
    let path = Path::new(fits_path);
    if !path.is_file() {
        return Err(anyhow::anyhow!(
            "File does not exist or is not accessible: {}",
            path.display()
        ));
    }

    let analyzer = PhotometricAnalyzer::new(settings);
    let analysis = analyzer.analyze_file(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&analysis)?),
        _ => print_analysis(path, analyzer.settings(), &analysis),
    }

    Ok(())
}

fn print_analysis(path: &Path, settings: &AnalyzerSettings, analysis: &StarAnalysis) {
    let bg = &analysis.background;
    println!("Star analysis: {}", path.display());
    println!(
        "  Region: {} x {} (crop 1/{})",
        analysis.width, analysis.height, settings.crop_factor
    );
    println!(
        "  Background: mean {:.2}, median {:.2}, std {:.2}",
        bg.mean, bg.median, bg.std
    );
    println!(
        "  Saturation ceiling: {:.0} ({}% of {} bit)",
        settings.saturation_ceiling(),
        settings.saturation_limit,
        settings.bit_depth
    );
    println!("  Detected: {}", analysis.candidates.len());
    println!(
        "  Accepted: {} (saturated {}, elongated {})",
        analysis.accepted.len(),
        analysis.rejected.saturated,
        analysis.rejected.elongated
    );
    println!(
        "  Fitted: {} (near edge {}, contaminated {}, fit failed {})",
        analysis.fitted.len(),
        analysis.rejected.near_edge,
        analysis.rejected.contaminated,
        analysis.rejected.fit_failed
    );

    if !analysis.fitted.is_empty() {
        println!();
        println!(
            "{:>4} {:>9} {:>9} {:>10} {:>9} {:>10} {:>10} {:>7} {:>7}",
            "#", "X", "Y", "Peak", "Peak/Med", "Roundness", "Sharpness", "FWHM", "RMSE"
        );
        println!("{:-<84}", "");
        for (i, star) in analysis.fitted.iter().enumerate() {
            let c = &star.candidate;
            println!(
                "{:>4} {:>9.2} {:>9.2} {:>10.1} {:>9.2} {:>10.3} {:>10.3} {:>7.2} {:>7.2}",
                i + 1,
                c.x,
                c.y,
                c.peak,
                star.peak_median_ratio,
                c.roundness,
                c.sharpness,
                star.fwhm(),
                star.psf.rmse
            );
        }
    }

    println!();
    match analysis.skip {
        Some(reason) => println!("No measurement: {}", reason),
        None => println!(
            "FWHM {:.2}  Eccentricity {:.2}  Mean {:.2}  Median {:.2}  Std {:.2}",
            analysis.measurement.fwhm,
            analysis.measurement.eccentricity,
            analysis.measurement.mean,
            analysis.measurement.median,
            analysis.measurement.std
        ),
    }
}
