#![allow(dead_code)]

pub use plcrash::{Config, Error, report::CrashReport, shared_handler};
use std::path::PathBuf;

/// A scratch location for a report, removed when dropped
pub struct ReportPath {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
}

pub fn report_path(name: &str) -> ReportPath {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join(format!("{name}.plcrash"));

    ReportPath { _dir: dir, path }
}

pub fn read_report(path: &std::path::Path) -> (Vec<u8>, CrashReport) {
    let data = std::fs::read(path).expect("failed to read crash report");
    let report = CrashReport::decode(&data).expect("failed to decode crash report");
    (data, report)
}
