//! Durable record of the upstream set, independent of health status.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::host::Host;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFileContents {
    hosts: Vec<String>,
}

/// Reads the persisted host list, if the file exists.
///
/// A missing file is treated as an empty set rather than an error, since the
/// first run of a freshly deployed proxy has nothing to restore.
pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Vec<Host>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let contents: StateFileContents = serde_json::from_str(&raw)?;
    let mut hosts = Vec::with_capacity(contents.hosts.len());
    for raw_host in contents.hosts {
        hosts.push(Host::parse(&raw_host)?);
    }
    Ok(hosts)
}

/// Atomically writes the host list: write to a temp file in the same
/// directory, then rename over the destination, so a reader never observes a
/// partially written file.
pub fn persist(path: impl AsRef<Path>, hosts: &[Host]) -> crate::error::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let contents = StateFileContents {
        hosts: hosts.iter().map(|h| h.as_str().to_string()).collect(),
    };
    let serialized = serde_json::to_string_pretty(&contents)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serialized)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let hosts = load("/tmp/ferry-state-file-tests-missing.json").unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn round_trips_host_list() {
        let dir = std::env::temp_dir().join(format!(
            "ferry-state-file-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("services.json");

        let hosts = vec![
            Host::parse("app1:3000").unwrap(),
            Host::parse("app2:3000").unwrap(),
        ];
        persist(&path, &hosts).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, hosts);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn persist_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!(
            "ferry-state-file-test-nested-{}",
            std::process::id()
        ));
        let path = dir.join("nested").join("services.json");

        persist(&path, &[]).unwrap();
        assert!(path.exists());

        fs::remove_dir_all(&dir).ok();
    }
}
