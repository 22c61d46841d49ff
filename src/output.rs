use std::io::{self, Write};

use serde::Serialize;

use crate::app::{PlanReport, ProgressEvent, ProgressSink, RunReport};
use crate::store::StoreSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_plan(report: &PlanReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_summary(summary: &StoreSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => println!("[{:>8.2}s] {}", elapsed.as_secs_f64(), event.message),
            None => println!("{}", event.message),
        }
    }
}

pub fn print_run_summary(report: &RunReport) {
    println!("*********************************************");
    println!(
        "Wrote {} records from {} files into {}",
        report.growth_len, report.files_discovered, report.store
    );
    if report.is_partial() {
        println!("{} file(s) failed permanently:", report.failures.len());
        for failure in &report.failures {
            println!(
                "  batch {}: {} ({} attempt(s)): {}",
                failure.batch, failure.location, failure.attempts, failure.reason
            );
        }
    }
    println!("---------- Total: {:.2} seconds ----------", report.elapsed_secs);
    println!("*********************************************");
}

pub fn print_plan(report: &PlanReport) {
    println!(
        "Found {} files to process in {} batches",
        report.files_discovered,
        report.batches.len()
    );
    for batch in &report.batches {
        println!(
            "batch {} ({}): {} files",
            batch.index,
            batch.mode,
            batch.locations.len()
        );
        for location in &batch.locations {
            println!("  {location}");
        }
    }
}

pub fn print_store_summary(summary: &StoreSummary) {
    println!("{}", summary.location);
    for array in &summary.arrays {
        println!(
            "  {:<28} {:<6} dims={:?} shape={:?} chunks={:?}",
            array.name, array.dtype, array.dims, array.shape, array.chunks
        );
    }
}
