//! Human-readable text output

use crate::chunk::ChunkPlan;
use crate::coordinator::{PreparedRun, RunSummary};
use crate::error::Outcome;
use crate::resource::format_bytes;

/// Chunks listed individually before the table is abbreviated
const PLAN_ROWS: usize = 40;

/// Print the negotiated resources and the chunk plan of a dry run
pub fn print_plan(prepared: &PreparedRun) {
    let grant = &prepared.grant;
    let (source_memory, task_memory) = prepared.budget.split_memory();

    println!("═══════════════════════════════════════════════════════════");
    println!("                    CHUNK PLAN");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Host:");
    println!("  Memory: {}", format_bytes(prepared.host.memory));
    println!("  Disk:   {}", format_bytes(prepared.host.disk));
    println!("  Cores:  {}", prepared.host.cores);
    println!();
    println!("Grant:");
    println!("  Workers:            {}", grant.worker_count);
    println!("  Coordinator memory: {}", format_bytes(grant.coordinator.memory));
    println!("  Worker memory:      {}", format_bytes(grant.worker.memory));
    println!("    record source:    {}", format_bytes(source_memory));
    println!("    task:             {}", format_bytes(task_memory));
    println!("  Worker disk:        {}", format_bytes(grant.worker.disk));
    println!("  Total memory:       {}", format_bytes(grant.total_memory()));
    println!();

    print_tables(&prepared.plan);
    print_chunks(&prepared.plan);
}

fn print_tables(plan: &ChunkPlan) {
    println!("Tables:");
    for ((name, records), bytes) in plan
        .table_names()
        .iter()
        .zip(plan.table_records())
        .zip(plan.table_bytes())
    {
        println!("  {:<20} {:>15} records  {:>12}", name, format_number(*records), format_bytes(*bytes));
    }
    println!();
}

fn print_chunks(plan: &ChunkPlan) {
    println!("Chunks: {}", plan.len());
    println!("  {:<10} {:>12} {:>12}  records per table", "id", "bytes", "root begin");
    for chunk in plan.iter().take(PLAN_ROWS) {
        let records: Vec<String> = chunk.expected_records().iter().map(|r| format_number(*r)).collect();
        println!(
            "  {:<10} {:>12} {:>12}  {}",
            chunk.id.to_string(),
            format_bytes(chunk.bytes()),
            chunk.root().begin,
            records.join(" / ")
        );
    }
    if plan.len() > PLAN_ROWS {
        println!("  ... {} more", plan.len() - PLAN_ROWS);
    }
    println!();
}

/// Print the final report of a job
pub fn print_summary(summary: &RunSummary) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    JOB SUMMARY");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Task:    {}", summary.task);
    if !summary.run_id.is_empty() {
        println!("Run:     {}", summary.run_id);
    }
    println!("Outcome: {}", summary.outcome);
    if let Some(message) = &summary.message {
        match summary.outcome {
            Outcome::Interrupted => println!("Warning: {}", message),
            _ => println!("Error:   {}", message),
        }
    }
    println!("Elapsed: {:.3}s", summary.elapsed_secs);
    println!("Workers: {}", summary.worker_count);
    println!();

    if !summary.totals.table_names.is_empty() {
        println!("Records:");
        for (i, name) in summary.totals.table_names.iter().enumerate() {
            let done = summary.totals.records.get(i).copied().unwrap_or(0);
            let expected = summary.expected_records.get(i).copied().unwrap_or(0);
            println!("  {:<20} {:>15} / {}", name, format_number(done), format_number(expected));
        }
        if summary.totals.unmatched > 0 {
            println!("  Unmatched secondary rows: {}", format_number(summary.totals.unmatched));
        }
        if summary.totals.duplicates > 0 {
            println!("  Duplicate root keys skipped: {}", format_number(summary.totals.duplicates));
        }
        println!();
        println!(
            "Chunks: {} planned, {} done, {} split",
            summary.chunks_planned, summary.totals.chunks_done, summary.totals.chunks_split
        );
    }

    let timings = &summary.timings;
    if timings.count > 0 {
        println!();
        println!("Chunk time:");
        println!("  Mean: {}", format_micros(timings.mean_us as u64));
        println!("  p50:  {}", format_micros(timings.p50_us));
        println!("  p90:  {}", format_micros(timings.p90_us));
        println!("  p99:  {}", format_micros(timings.p99_us));
        println!("  Max:  {}", format_micros(timings.max_us));
    }

    if !summary.task_summary.is_null() {
        println!();
        println!("Task result:");
        match serde_json::to_string_pretty(&summary.task_summary) {
            Ok(text) => text.lines().for_each(|line| println!("  {}", line)),
            Err(_) => println!("  {}", summary.task_summary),
        }
    }
    println!();
}

/// Format number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

pub fn format_micros(micros: u64) -> String {
    if micros < 1000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.3}ms", micros as f64 / 1000.0)
    } else if micros < 60_000_000 {
        format!("{:.3}s", micros as f64 / 1_000_000.0)
    } else if micros < 3_600_000_000 {
        format!("{:.2}m", micros as f64 / 60_000_000.0)
    } else {
        format!("{:.2}h", micros as f64 / 3_600_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_format_micros() {
        assert_eq!(format_micros(0), "0µs");
        assert_eq!(format_micros(1500), "1.500ms");
        assert_eq!(format_micros(2_000_000), "2.000s");
        assert_eq!(format_micros(90_000_000), "1.50m");
    }
}
