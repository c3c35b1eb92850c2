//! Chunk export
//!
//! Writes every retained chunk to its own parquet, arrow-ipc, or csv file so
//! charting tools can read the loaded history offline.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::{ChunkBuffer, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Parquet,
    ArrowIpc,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Parquet => "parquet",
            ExportFormat::ArrowIpc => "arrow",
            ExportFormat::Csv => "csv",
        }
    }
}

fn file_stem(signal: &str) -> String {
    signal
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns `stem`, or `stem_2`, `stem_3`, ... when it is already taken.
fn unique_stem(stem: String, used: &mut HashSet<String>) -> String {
    let mut candidate = stem.clone();
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = format!("{stem}_{n}");
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

/// Exports all chunks in `chunks` into `output_path`, one file per signal.
/// Empty chunks are skipped. Signals whose sanitized names collide get a
/// numeric suffix. Returns the written files.
pub fn run(chunks: &ChunkBuffer, output_path: &Path, format: ExportFormat) -> Result<Vec<PathBuf>, Error> {
    std::fs::create_dir_all(output_path)?;
    println!("Exporting to: {}", output_path.display());

    let mut written = Vec::new();
    let mut skipped_count = 0;
    let mut used = HashSet::new();
    for signal in chunks.signals() {
        let chunk = chunks.get(&signal)?;
        let record_batch = chunk.record_batch();
        let row_count = record_batch.num_rows();
        if row_count == 0 {
            println!("  Skipping {} (empty)", signal);
            skipped_count += 1;
            continue;
        }

        let stem = unique_stem(file_stem(&signal), &mut used);
        let file_name = format!("{}.{}", stem, format.extension());
        let file_path = output_path.join(&file_name);
        let mut file = File::create(&file_path)?;
        match format {
            ExportFormat::ArrowIpc => {
                let mut writer =
                    arrow::ipc::writer::FileWriter::try_new(&mut file, record_batch.schema_ref())?;
                writer.write(record_batch)?;
                writer.finish()?;
            }
            #[cfg(feature = "parquet")]
            ExportFormat::Parquet => {
                let mut writer = parquet::arrow::ArrowWriter::try_new(
                    &mut file,
                    record_batch.schema(),
                    None,
                )?;
                writer.write(record_batch)?;
                writer.close()?;
            }
            #[cfg(not(feature = "parquet"))]
            ExportFormat::Parquet => {
                drop(file);
                std::fs::remove_file(&file_path)?;
                return Err(Error::Config(
                    "parquet export requires the parquet feature".to_string(),
                ));
            }
            ExportFormat::Csv => {
                let mut writer = arrow::csv::Writer::new(&mut file);
                writer.write(record_batch)?;
            }
        }
        println!("  Exported {} ({} rows)", file_name, row_count);
        written.push(file_path);
    }

    println!(
        "Export complete: {} chunks exported, {} skipped",
        written.len(),
        skipped_count
    );
    Ok(written)
}
