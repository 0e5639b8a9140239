//! Runtime configuration.
//!
//! Reads the process environment once at [`Runtime`](crate::Runtime)
//! creation; embedders can also build a configuration programmatically and
//! pass it to [`Runtime::with_config`](crate::Runtime::with_config).

use std::path::PathBuf;

/// Default bound on queued parameter operations per block.
pub const DEFAULT_PARAMETER_QUEUE_LENGTH: usize = 10;

/// Upper clamp for `QS_PARAMETER_QUEUE_LENGTH`.
const MAX_PARAMETER_QUEUE_LENGTH: usize = 10_000;

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Extra directories searched for block module libraries, in order,
    /// before the installed `quickstream/blocks` directory.
    pub block_path: Vec<PathBuf>,
    /// Maximum number of queued parameter set/get operations per block.
    pub parameter_queue_length: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            block_path: Vec::new(),
            parameter_queue_length: DEFAULT_PARAMETER_QUEUE_LENGTH,
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration from environment variables.
    ///
    /// Reads:
    /// - `QS_BLOCK_PATH`: colon-separated extra module search directories
    /// - `QS_PARAMETER_QUEUE_LENGTH`: bounded integer, default 10
    ///
    /// Unparsable values fall back to the default with a warning rather
    /// than failing runtime creation.
    pub fn from_env() -> Self {
        let block_path = std::env::var("QS_BLOCK_PATH")
            .map(|raw| {
                raw.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let parameter_queue_length = match std::env::var("QS_PARAMETER_QUEUE_LENGTH") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if (1..=MAX_PARAMETER_QUEUE_LENGTH).contains(&n) => n,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        default = DEFAULT_PARAMETER_QUEUE_LENGTH,
                        "Ignoring invalid QS_PARAMETER_QUEUE_LENGTH"
                    );
                    DEFAULT_PARAMETER_QUEUE_LENGTH
                }
            },
            Err(_) => DEFAULT_PARAMETER_QUEUE_LENGTH,
        };

        Self {
            block_path,
            parameter_queue_length,
        }
    }

    /// Prepend a directory to the module search path.
    pub fn with_block_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.block_path.insert(0, dir.into());
        self
    }

    /// Set the per-block parameter queue bound (clamped to at least 1).
    pub fn with_parameter_queue_length(mut self, len: usize) -> Self {
        self.parameter_queue_length = len.clamp(1, MAX_PARAMETER_QUEUE_LENGTH);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_block_path_is_split_on_colons() {
        std::env::set_var("QS_BLOCK_PATH", "/a/blocks:/b/blocks:");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("QS_BLOCK_PATH");

        assert_eq!(
            config.block_path,
            vec![PathBuf::from("/a/blocks"), PathBuf::from("/b/blocks")]
        );
    }

    #[test]
    #[serial]
    fn env_queue_length_bounds() {
        std::env::set_var("QS_PARAMETER_QUEUE_LENGTH", "25");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.parameter_queue_length, 25);

        std::env::set_var("QS_PARAMETER_QUEUE_LENGTH", "0");
        let config = RuntimeConfig::from_env();
        assert_eq!(
            config.parameter_queue_length,
            DEFAULT_PARAMETER_QUEUE_LENGTH
        );

        std::env::set_var("QS_PARAMETER_QUEUE_LENGTH", "not-a-number");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("QS_PARAMETER_QUEUE_LENGTH");
        assert_eq!(
            config.parameter_queue_length,
            DEFAULT_PARAMETER_QUEUE_LENGTH
        );
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        std::env::remove_var("QS_BLOCK_PATH");
        std::env::remove_var("QS_PARAMETER_QUEUE_LENGTH");
        let config = RuntimeConfig::from_env();
        assert!(config.block_path.is_empty());
        assert_eq!(
            config.parameter_queue_length,
            DEFAULT_PARAMETER_QUEUE_LENGTH
        );
    }

    #[test]
    fn builders() {
        let config = RuntimeConfig::default()
            .with_block_dir("/opt/blocks")
            .with_parameter_queue_length(0);
        assert_eq!(config.block_path, vec![PathBuf::from("/opt/blocks")]);
        assert_eq!(config.parameter_queue_length, 1);
    }
}
