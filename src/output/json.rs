//! JSON output.

use super::RunReport;

pub fn render_json(report: &RunReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn print_json(report: &RunReport) {
    println!("{}", render_json(report));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::fixtures;
    use serde_json::{Value, json};

    #[test]
    fn test_render_json_shape() {
        let value: Value = serde_json::from_str(&render_json(&fixtures::report())).unwrap();

        assert_eq!(value["calls"][0]["result"], json!(4));
        assert_eq!(value["calls"][0]["worker_id"], json!(1));
        assert!(value["calls"][0].get("error").is_none());
        assert!(value["calls"][1].get("result").is_none());
        assert_eq!(value["workers"][0]["state"], json!("idle"));
        assert_eq!(value["force_exited"], json!(false));
    }
}
