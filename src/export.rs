use anyhow::Result;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::capture::CaptureMetadata;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }
}

/// One timeline row, flattened for spreadsheet-friendly output.
#[derive(Debug, Serialize)]
struct ExportedCapture<'a> {
    plant_id: &'a str,
    plant_display_name: &'a str,
    capture_time: String,
    filename: &'a str,
    relative_path: &'a str,
    width: u32,
    height: u32,
    size_in_bytes: u64,
    notes: &'a str,
}

impl<'a> From<&'a CaptureMetadata> for ExportedCapture<'a> {
    fn from(m: &'a CaptureMetadata) -> Self {
        Self {
            plant_id: m.plant_id.as_deref().unwrap_or(""),
            plant_display_name: &m.plant_display_name,
            capture_time: m.capture_time.to_rfc3339(),
            filename: &m.filename,
            relative_path: &m.relative_path,
            width: m.image_properties.width,
            height: m.image_properties.height,
            size_in_bytes: m.image_properties.size_in_bytes,
            notes: &m.notes,
        }
    }
}

/// Write a timeline to `output_path`. Returns the number of rows written.
pub fn export_timeline(
    records: &[CaptureMetadata],
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let rows: Vec<ExportedCapture> = records.iter().map(ExportedCapture::from).collect();

    match format {
        ExportFormat::Json => export_json(&rows, output_path)?,
        ExportFormat::Csv => export_csv(&rows, output_path)?,
    }

    Ok(rows.len())
}

fn export_json(rows: &[ExportedCapture], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(rows)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(rows: &[ExportedCapture], output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
