//! Plain text output: one line per call, in input order, no colors.
//!
//! Successful calls print their result as compact JSON; failed ones print
//! `error: <message>`.

use super::{RunReport, compact};

pub fn render_plain(report: &RunReport) -> String {
    let mut out = String::new();
    for call in &report.calls {
        match (&call.result, &call.error) {
            (_, Some(error)) => out.push_str(&format!("error: {}\n", error)),
            (Some(result), None) => out.push_str(&format!("{}\n", compact(result))),
            (None, None) => out.push_str("null\n"),
        }
    }

    if let Some(workers) = &report.workers {
        out.push_str("WORKER\tSTATE\tPID\tJOBS\tRESTARTS\n");
        for w in workers {
            let pid = w.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                w.worker_id, w.state, pid, w.jobs_completed, w.restarts
            ));
        }
    }
    out
}

pub fn print_plain(report: &RunReport) {
    print!("{}", render_plain(report));
}
