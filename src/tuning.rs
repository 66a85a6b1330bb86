//! Auto-tuning module
//!
//! Detects hardware capabilities and derives checkpoint parallelism and
//! buffer sizes when the configuration leaves them unset.

use sysinfo::System;

/// Tuned configuration values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Page write worker threads used by checkpoints
    pub checkpoint_threads: usize,
    /// Threads of the fork/join page sort pool
    pub sort_threads: usize,
    /// Suggested page write batch size
    pub batch_pages: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            checkpoint_threads: 4,
            sort_threads: 4,
            batch_pages: 512,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune configuration based on detected hardware
///
/// Allocation strategy:
/// - checkpoint writers get half of the cores (min 1, max 16); page writes are
///   I/O bound so more threads than that rarely help
/// - the sort pool gets every core, it only runs during checkpoint start
/// - batches grow with RAM, ~256 pages per GB (min 256, max 4096)
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let checkpoint_threads = (cores / 2).clamp(1, 16);
    let sort_threads = cores.max(1);

    let batch_pages = ((ram_mb / 1024) as usize * 256).clamp(256, 4096);

    let config = TunedConfig {
        checkpoint_threads,
        sort_threads,
        batch_pages,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::debug!(
        cores = cores,
        ram_mb = ram_mb,
        checkpoint_threads = config.checkpoint_threads,
        sort_threads = config.sort_threads,
        batch_pages = config.batch_pages,
        "Auto-tuned configuration based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         Checkpoint: {} writer threads, {} sort threads, {} pages per batch",
        config.detected_cores,
        config.detected_ram_mb,
        config.checkpoint_threads,
        config.sort_threads,
        config.batch_pages,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();

        assert!(config.checkpoint_threads >= 1);
        assert!(config.checkpoint_threads <= 16);
        assert!(config.sort_threads >= 1);
        assert!(config.batch_pages >= 256);
        assert!(config.batch_pages <= 4096);
    }

    #[test]
    fn test_summary_mentions_threads() {
        let summary = tuning_summary(&TunedConfig::default());
        assert!(summary.contains("4 writer threads"));
    }
}
