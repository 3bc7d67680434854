//! Minimal `key = value` configuration file adapter (spec.md §6
//! "Configuration"). The wire/file *format* is an external-collaborator
//! concern explicitly out of scope (spec.md §1); this exists only so
//! the CLI's `-c <file>` flag means something.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AoError, AoResult};

/// A parsed `key = value` text file, plus the directory it lives in for
/// relative-path resolution.
pub struct ConfigFile {
    dir: PathBuf,
    values: HashMap<String, String>,
}

impl ConfigFile {
    /// Loads and parses `path`. Blank lines and `#`-prefixed comments
    /// are ignored; every other non-blank line must be `key = value`.
    pub fn load<P: AsRef<Path>>(path: P) -> AoResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut values = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                AoError::config(format!("{}:{}: not a `key = value` line", path.display(), lineno + 1))
            })?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { dir, values })
    }

    fn raw(&self, key: &str) -> AoResult<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| AoError::config(format!("missing required key: {key}")))
    }

    pub fn get_string(&self, key: &str) -> AoResult<String> {
        self.raw(key).map(str::to_string)
    }

    pub fn get_f64(&self, key: &str) -> AoResult<f64> {
        self.raw(key)?
            .parse()
            .map_err(|_| AoError::config(format!("key {key} is not a number")))
    }

    pub fn get_usize(&self, key: &str) -> AoResult<usize> {
        self.raw(key)?
            .parse()
            .map_err(|_| AoError::config(format!("key {key} is not an unsigned integer")))
    }

    pub fn get_bool(&self, key: &str) -> AoResult<bool> {
        match self.raw(key)? {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(AoError::config(format!("key {key} is not a boolean: {other}"))),
        }
    }

    /// Resolves `key`'s value as a path, relative to the configuration
    /// file's own directory unless it is already absolute.
    pub fn get_path(&self, key: &str) -> AoResult<PathBuf> {
        let raw = self.raw(key)?;
        let p = Path::new(raw);
        Ok(if p.is_absolute() { p.to_path_buf() } else { self.dir.join(p) })
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }
    pub fn get_usize_or(&self, key: &str, default: usize) -> usize {
        self.get_usize(key).unwrap_or(default)
    }
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }
    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|_| default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao.conf");
        std::fs::write(&path, "# a comment\nexposure = 0.01\nmla_csv = mla.csv\n").unwrap();
        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(cfg.get_f64("exposure").unwrap(), 0.01);
        assert_eq!(cfg.get_path("mla_csv").unwrap(), dir.path().join("mla.csv"));
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao.conf");
        std::fs::write(&path, "exposure = 0.01\n").unwrap();
        let cfg = ConfigFile::load(&path).unwrap();
        assert!(matches!(cfg.get_f64("gain"), Err(AoError::Config { .. })));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ao.conf");
        std::fs::write(&path, "not a kv line\n").unwrap();
        assert!(ConfigFile::load(&path).is_err());
    }
}
