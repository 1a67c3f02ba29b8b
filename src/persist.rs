use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Result, SubwordError};

/// Write `value` as pretty JSON. The file is written next to `path` and
/// renamed into place, so readers never observe a partial model.
pub(crate) fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent_dir).map_err(|e| SubwordError::io(parent_dir, e))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir).map_err(|e| SubwordError::io(parent_dir, e))?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush().map_err(|e| SubwordError::io(path, e))?;
    }

    temp_file.persist(path).map_err(|e| SubwordError::io(path, e.error))?;
    log::info!("saved model to {}", path.display());
    Ok(())
}

pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| SubwordError::io(path, e))?;
    let value = serde_json::from_reader(BufReader::new(file))?;
    log::info!("loaded model from {}", path.display());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_save_then_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b.json");
        let mut value = BTreeMap::new();
        value.insert("x".to_string(), 3u64);
        save_json(&value, &path).unwrap();
        let back: BTreeMap<String, u64> = load_json(&path).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_save_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        save_json(&vec![1u32, 2], &path).unwrap();
        save_json(&vec![3u32], &path).unwrap();
        let back: Vec<u32> = load_json(&path).unwrap();
        assert_eq!(back, vec![3]);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_json::<Vec<u32>>(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, SubwordError::Io { .. }));
    }

    #[test]
    fn test_load_garbage_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();
        let err = load_json::<Vec<u32>>(&path).unwrap_err();
        assert!(matches!(err, SubwordError::Serialization(_)));
    }
}
