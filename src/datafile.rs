//! JSON datafile for servo runs, calibrations and other measurements.
//!
//! The file holds named groups, each holding named datasets. Names are made
//! unique with a zero-padded counter, so repeated runs never overwrite each
//! other. Every write rewrites the whole document.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Datafile errors.
#[derive(Error, Debug)]
pub enum DatafileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No group named {0}")]
    NoGroup(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Dataset {
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Group {
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    datasets: BTreeMap<String, Dataset>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    groups: BTreeMap<String, Group>,
}

/// A lazily created JSON datafile.
#[derive(Debug)]
pub struct Datafile {
    path: PathBuf,
    document: Document,
}

/// `microscope_datafile_YYYYMMDD.json` for today's local date.
pub fn default_filename() -> String {
    format!("microscope_datafile_{}.json", Local::now().format("%Y%m%d"))
}

impl Datafile {
    /// Open `path`, creating it now. Existing groups are kept.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DatafileError> {
        let path = path.into();
        let document = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Document::default()
        };
        let datafile = Self { path, document };
        datafile.flush()?;
        Ok(datafile)
    }

    /// A datafile with the default name in `dir`. Nothing is written until
    /// the first group is added.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(default_filename()),
            document: Document::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Group names, sorted.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.document.groups.keys().map(String::as_str)
    }

    /// Dataset names in `group`, sorted.
    pub fn datasets(&self, group: &str) -> Option<impl Iterator<Item = &str>> {
        self.document
            .groups
            .get(group)
            .map(|g| g.datasets.keys().map(String::as_str))
    }

    /// Add a group called `name000`, `name001`, ... and return its name.
    pub fn new_group(
        &mut self,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, DatafileError> {
        let key = unique_name(name, 3, |k| self.document.groups.contains_key(k));
        self.document.groups.insert(
            key.clone(),
            Group {
                timestamp: Utc::now(),
                description: description.map(str::to_string),
                datasets: BTreeMap::new(),
            },
        );
        self.flush()?;
        tracing::debug!("Datafile {}: new group {}", self.path.display(), key);
        Ok(key)
    }

    /// Store `data` in `group` as `dataset00000`, `dataset00001`, ... and
    /// return the dataset name. The file is rewritten afterwards.
    pub fn add_data<D: Serialize + ?Sized>(
        &mut self,
        group: &str,
        dataset: &str,
        data: &D,
        description: Option<&str>,
    ) -> Result<String, DatafileError> {
        let data = serde_json::to_value(data)?;
        let datasets = &mut self
            .document
            .groups
            .get_mut(group)
            .ok_or_else(|| DatafileError::NoGroup(group.to_string()))?
            .datasets;
        let key = unique_name(dataset, 5, |k| datasets.contains_key(k));
        datasets.insert(
            key.clone(),
            Dataset {
                timestamp: Utc::now(),
                description: description.map(str::to_string),
                data,
            },
        );
        self.flush()?;
        Ok(key)
    }

    /// Read a stored dataset back.
    pub fn get<D: for<'de> Deserialize<'de>>(
        &self,
        group: &str,
        dataset: &str,
    ) -> Result<Option<D>, DatafileError> {
        let Some(entry) = self
            .document
            .groups
            .get(group)
            .and_then(|g| g.datasets.get(dataset))
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(entry.data.clone())?))
    }

    /// Write the whole document to disk.
    pub fn flush(&self) -> Result<(), DatafileError> {
        let json = serde_json::to_string_pretty(&self.document)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

fn unique_name(base: &str, width: usize, taken: impl Fn(&str) -> bool) -> String {
    (0..)
        .map(|n| format!("{}{:0width$}", base, n, width = width))
        .find(|k| !taken(k))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Position;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("microscope_stage_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_default_filename() {
        let name = default_filename();
        assert!(name.starts_with("microscope_datafile_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "microscope_datafile_YYYYMMDD.json".len());
    }

    #[test]
    fn test_lazy_creation() {
        let dir = scratch_dir("lazy");
        let mut datafile = Datafile::in_dir(&dir);
        assert!(!datafile.path().exists());

        datafile.new_group("tracking", None).unwrap();
        assert!(datafile.path().exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unique_names_and_reload() {
        let dir = scratch_dir("names");
        let path = dir.join("data.json");
        let mut datafile = Datafile::open(&path).unwrap();

        assert_eq!(datafile.new_group("calibration", Some("first")).unwrap(), "calibration000");
        assert_eq!(datafile.new_group("calibration", None).unwrap(), "calibration001");

        let first = datafile
            .add_data("calibration000", "moves", &[Position::new(1, 2, 3)], None)
            .unwrap();
        let second = datafile
            .add_data("calibration000", "moves", &[Position::new(4, 5, 6)], Some("again"))
            .unwrap();
        assert_eq!(first, "moves00000");
        assert_eq!(second, "moves00001");

        let reopened = Datafile::open(&path).unwrap();
        assert_eq!(
            reopened.groups().collect::<Vec<_>>(),
            vec!["calibration000", "calibration001"]
        );
        let moves: Option<Vec<Position>> = reopened.get("calibration000", "moves00001").unwrap();
        assert_eq!(moves, Some(vec![Position::new(4, 5, 6)]));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_add_data_to_missing_group() {
        let dir = scratch_dir("missing");
        let mut datafile = Datafile::in_dir(&dir);
        let result = datafile.add_data("nope", "x", &1, None);
        assert!(matches!(result, Err(DatafileError::NoGroup(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
