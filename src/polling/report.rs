use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write;

use super::TestResult;

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

/// Latest test result per target.
#[derive(Default)]
pub struct TestResultStore {
    results: RwLock<BTreeMap<String, TestResult>>,
}

impl TestResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `result`, replacing any earlier run for the same target.
    pub fn insert(&self, result: TestResult) -> Option<TestResult> {
        self.results.write().insert(result.target.clone(), result)
    }

    pub fn get(&self, target: &str) -> Option<TestResult> {
        self.results.read().get(target).cloned()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.results.read().contains_key(target)
    }

    /// Whether the latest run for `target` passed
    pub fn passed(&self, target: &str) -> bool {
        self.results.read().get(target).is_some_and(|r| r.success)
    }

    pub fn remove(&self, target: &str) -> Option<TestResult> {
        self.results.write().remove(target)
    }

    pub fn list(&self) -> Vec<TestResult> {
        self.results.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// Plain-text summary followed by per-target details.
    pub fn generate_report(&self) -> String {
        let results = self.results.read();
        let total = results.len();
        let passed = results.values().filter(|r| r.success).count();
        let rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64 * 100.0
        };

        let mut report = String::new();
        let _ = writeln!(report, "=== Device Test Report ===");
        let _ = writeln!(report, "Generated: {}", Utc::now().to_rfc3339());
        let _ = writeln!(report);
        let _ = writeln!(report, "Summary:");
        let _ = writeln!(report, "- Total Devices Tested: {total}");
        let _ = writeln!(report, "- Successful Tests: {passed}");
        let _ = writeln!(report, "- Failed Tests: {}", total - passed);
        let _ = writeln!(report, "- Success Rate: {rate:.1}%");
        let _ = writeln!(report);
        let _ = writeln!(report, "Detailed Results:");

        for (target, r) in results.iter() {
            let _ = writeln!(report);
            let _ = writeln!(report, "--- {target} ---");
            let _ = writeln!(report, "Manufacturer: {}", r.manufacturer);
            let _ = writeln!(report, "Model: {}", r.model);
            let _ = writeln!(report, "Success: {}", yes_no(r.success));
            let _ = writeln!(report, "Port Available: {}", yes_no(r.port_available));
            let _ = writeln!(report, "Protocol Responds: {}", yes_no(r.protocol_responds));
            let _ = writeln!(report, "Data Parsing: {}", yes_no(r.data_parses));
            let _ = writeln!(
                report,
                "Sustained Polling: {} ({:.1}%)",
                yes_no(r.sustained_polling),
                r.success_rate * 100.0
            );
            let _ = writeln!(report, "Readings Collected: {}", r.readings_collected);
            if let Some(error) = &r.error_message {
                let _ = writeln!(report, "Error: {error}");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceConfig;

    fn result(target: &str, success: bool) -> TestResult {
        let config = DeviceConfig::serial("/dev/ttyUSB0", 9600, 1);
        let mut r = TestResult::not_testable(target, &config, "Port not available");
        if success {
            r.success = true;
            r.port_available = true;
            r.protocol_responds = true;
            r.data_parses = true;
            r.sustained_polling = true;
            r.success_rate = 0.9;
            r.readings_collected = 5;
            r.error_message = None;
        }
        r
    }

    #[test]
    fn test_latest_result_wins() {
        let store = TestResultStore::new();
        assert!(store.insert(result("inv", false)).is_none());
        let previous = store.insert(result("inv", true)).unwrap();
        assert!(!previous.success);
        assert_eq!(store.len(), 1);
        assert!(store.get("inv").unwrap().success);
    }

    #[test]
    fn test_passed_tracks_latest_run() {
        let store = TestResultStore::new();
        assert!(!store.passed("inv"));
        store.insert(result("inv", false));
        assert!(store.contains("inv"));
        assert!(!store.passed("inv"));
        store.insert(result("inv", true));
        assert!(store.passed("inv"));
    }

    #[test]
    fn test_report_totals_and_details() {
        let store = TestResultStore::new();
        store.insert(result("rtu_ttyUSB0_1", true));
        store.insert(result("rtu_ttyUSB1_2", false));

        let report = store.generate_report();
        assert!(report.contains("- Total Devices Tested: 2"));
        assert!(report.contains("- Successful Tests: 1"));
        assert!(report.contains("- Failed Tests: 1"));
        assert!(report.contains("- Success Rate: 50.0%"));
        assert!(report.contains("--- rtu_ttyUSB0_1 ---"));
        assert!(report.contains("Sustained Polling: YES (90.0%)"));
        assert!(report.contains("Error: Port not available"));
    }

    #[test]
    fn test_empty_report() {
        let report = TestResultStore::new().generate_report();
        assert!(report.contains("- Total Devices Tested: 0"));
        assert!(report.contains("- Success Rate: 0.0%"));
    }
}
