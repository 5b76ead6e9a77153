use rollout_core::aggregator;
use rollout_core::execution::{ReleaseExecution, StageExecution};
use rollout_core::types::StageStatus;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

pub fn format_duration(ms: Option<u64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1_000 => format!("{ms}ms"),
        Some(ms) if ms < 60_000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

fn approval_cell(stage: &StageExecution) -> String {
    match (stage.approval_gate, stage.approval_status) {
        (Some(gate), Some(status)) => format!("{gate}:{status}"),
        _ => "-".to_string(),
    }
}

/// Human-readable view of one execution with its stage table.
pub fn print_execution(execution: &ReleaseExecution) {
    println!("Execution: {}", execution.id);
    println!(
        "Release:   {} ({}) #{}",
        execution.release_name, execution.release_id, execution.release_number
    );
    println!("Status:    {}", execution.status);
    let summary = aggregator::summarize(execution);
    let counts: Vec<String> = summary
        .members
        .iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect();
    println!("Members:   {}", counts.join(", "));
    if let Some(by) = &execution.request.triggered_by {
        println!("Triggered: {by}");
    }
    if execution.duration_ms.is_some() {
        println!("Duration:  {}", format_duration(execution.duration_ms));
    }
    if let Some(error) = &execution.error {
        println!("Error:     {error}");
    }
    println!();

    let rows = execution
        .stages
        .iter()
        .map(|s| {
            vec![
                s.unit_index.to_string(),
                s.label.clone(),
                s.status.to_string(),
                approval_cell(s),
                format_duration(s.duration_ms),
                s.id.to_string(),
            ]
        })
        .collect();
    print_table(
        &["UNIT", "TARGET", "STATUS", "APPROVAL", "DURATION", "STAGE EXECUTION"],
        rows,
    );

    for stage in execution
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::AwaitingApproval)
    {
        println!(
            "\n{} awaits approval: rollout approve {} {} --by <name>",
            stage.label, execution.id, stage.id
        );
    }
    for stage in execution
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Failed)
    {
        if let Some(error) = &stage.error {
            println!("\n{} failed: {error}", stage.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(250)), "250ms");
        assert_eq!(format_duration(Some(1_500)), "1.5s");
        assert_eq!(format_duration(Some(125_000)), "2m05s");
    }
}
