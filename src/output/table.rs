//! Colored table output.

use super::{RunReport, TableOptions, compact};
use crate::theme::{Semantic, ThemedCell};
use comfy_table::{
    Cell, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};

fn new_table(options: TableOptions) -> Table {
    let mut table = Table::new();
    if options.ascii {
        table.load_preset(ASCII_FULL);
    } else {
        table.load_preset(UTF8_FULL);
    }
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn render_calls(report: &RunReport, options: TableOptions) -> Option<String> {
    if report.calls.is_empty() {
        return None;
    }

    let mut table = new_table(options);
    table.set_header(vec!["#", "Args", "Worker", "Time", "Result"]);

    for call in &report.calls {
        let args = compact(&serde_json::Value::Array(call.args.clone()));
        let worker = call
            .worker_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let outcome = match (&call.result, &call.error) {
            (_, Some(error)) => Cell::new(error).themed(Semantic::Failure),
            (Some(result), None) => Cell::new(compact(result)).themed(Semantic::Success),
            (None, None) => Cell::new("null").themed(Semantic::Muted),
        };

        table.add_row(vec![
            Cell::new(call.index),
            Cell::new(args),
            Cell::new(worker).themed(Semantic::WorkerId),
            Cell::new(format!("{}ms", call.elapsed_ms)).themed(Semantic::Muted),
            outcome,
        ]);
    }
    Some(table.to_string())
}

pub fn render_workers(report: &RunReport, options: TableOptions) -> Option<String> {
    let workers = report.workers.as_ref()?;

    let mut table = new_table(options);
    table.set_header(vec!["Worker", "State", "PID", "Jobs", "Restarts", "Queued"]);
    for w in workers {
        let pid = w.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        table.add_row(vec![
            Cell::new(w.worker_id).themed(Semantic::WorkerId),
            Cell::new(w.state).themed(Semantic::for_state(w.state)),
            Cell::new(pid),
            Cell::new(w.jobs_completed),
            Cell::new(w.restarts),
            Cell::new(w.queued),
        ]);
    }
    Some(table.to_string())
}

pub fn print_table(report: &RunReport, options: TableOptions) {
    match render_calls(report, options) {
        Some(calls) => println!("{calls}"),
        None => println!("No calls made."),
    }
    if let Some(workers) = render_workers(report, options) {
        println!("{workers}");
    }
}
