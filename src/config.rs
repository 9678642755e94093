use std::path::PathBuf;

/// Default number of consecutive addresses backed by one segment file.
pub const RECORDS_PER_LOG_FILE: u64 = 10_000;

/// Configuration for the log store
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,

    /// Addresses per segment file (default: 10 000)
    pub records_per_file: u64,

    /// Distinct pending trims required before a full segment is compacted
    /// (default: 25% of `records_per_file`)
    pub trim_threshold: usize,

    /// Skip entry checksum verification on read and recovery (default: false)
    pub no_verify: bool,
}

impl LogConfig {
    /// Configuration for a store rooted at `dir`, with defaults elsewhere.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./streamlog"),
            records_per_file: RECORDS_PER_LOG_FILE,
            trim_threshold: (RECORDS_PER_LOG_FILE / 4) as usize,
            no_verify: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::new("/tmp/somewhere");
        assert_eq!(config.dir, PathBuf::from("/tmp/somewhere"));
        assert_eq!(config.records_per_file, 10_000);
        assert_eq!(config.trim_threshold, 2_500);
        assert!(!config.no_verify);
    }
}
