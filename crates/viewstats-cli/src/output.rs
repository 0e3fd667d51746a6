use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use viewstats_core::query::QueryResponse;

use crate::cli::OutputFormat;

/// Write a query response. JSON carries the source and completeness report;
/// CSV carries only the result rows.
pub fn write_response<T: Serialize, W: Write>(
    out: &mut W,
    response: &QueryResponse<T>,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, response)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            for row in &response.results {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}

/// One JSON document per line, for run reports.
pub fn write_json_line<T: Serialize, W: Write>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
