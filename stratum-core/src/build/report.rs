//! Final image report.
//!
//! Thread-safe map of built image descriptors, marshalled to tab-indented
//! JSON. Field names are stable wire identifiers consumed by downstream
//! tooling; do not rename.

use crate::error::{Result, StratumError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One built image in the report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReportImageRecord {
    #[serde(rename = "WerfImageName")]
    pub werf_image_name: String,
    #[serde(rename = "DockerRepo")]
    pub docker_repo: String,
    #[serde(rename = "DockerTag")]
    pub docker_tag: String,
    #[serde(rename = "DockerImageID")]
    pub docker_image_id: String,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    #[serde(rename = "Images")]
    images: &'a BTreeMap<String, ReportImageRecord>,
}

/// Concurrent-safe image name → record map.
#[derive(Debug, Default)]
pub struct ImagesReport {
    images: Mutex<BTreeMap<String, ReportImageRecord>>,
}

impl ImagesReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image_record(&self, name: &str, record: ReportImageRecord) {
        self.images.lock().unwrap().insert(name.to_string(), record);
    }

    pub fn get_image_record(&self, name: &str) -> Option<ReportImageRecord> {
        self.images.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.lock().unwrap().is_empty()
    }

    /// Marshal to pretty JSON with tab indentation.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let images = self.images.lock().unwrap();

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        ReportJson { images: &*images }
            .serialize(&mut serializer)
            .map_err(StratumError::ReportJson)?;

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(suffix: &str) -> ReportImageRecord {
        ReportImageRecord {
            werf_image_name: format!("proj-stages:{}", suffix),
            docker_repo: "proj-stages".to_string(),
            docker_tag: suffix.to_string(),
            docker_image_id: format!("sha256:{}", suffix),
        }
    }

    #[test]
    fn test_report_json_shape() {
        let report = ImagesReport::new();
        report.set_image_record("backend", record("aa-1"));

        let json = String::from_utf8(report.to_json().unwrap()).unwrap();

        assert!(json.contains("\"Images\""));
        assert!(json.contains("\t\"backend\""));
        assert!(json.contains("\"WerfImageName\": \"proj-stages:aa-1\""));
        assert!(json.contains("\"DockerRepo\": \"proj-stages\""));
        assert!(json.contains("\"DockerTag\": \"aa-1\""));
        assert!(json.contains("\"DockerImageID\": \"sha256:aa-1\""));
    }

    #[test]
    fn test_records_overwrite_by_name() {
        let report = ImagesReport::new();
        report.set_image_record("app", record("aa-1"));
        report.set_image_record("app", record("bb-2"));

        assert_eq!(report.len(), 1);
        assert_eq!(report.get_image_record("app").unwrap().docker_tag, "bb-2");
    }

    #[test]
    fn test_empty_report_serializes() {
        let report = ImagesReport::new();
        let json = String::from_utf8(report.to_json().unwrap()).unwrap();
        assert!(json.contains("\"Images\": {}"));
    }
}
