//! A lazy-release-consistent distributed shared memory runtime: vector
//! clocks, a paged virtual address space with access-rights fault
//! dispatch, a TreadMarks-style lazy consistency engine, and a centralized
//! lock/barrier arbiter, wired together behind a transport abstraction.

pub mod arbiter;
pub mod clock;
pub mod diff;
pub mod engine;
pub mod error;
pub mod host;
pub mod memory;
pub mod page_array;
pub mod process_array;
pub mod transport;

pub use error::{DsmError, Result};
pub use host::Host;

/// Runtime configuration, fixed for the lifetime of a run: process count
/// cannot change after startup (see Non-goals).
#[derive(Debug, Clone)]
pub struct Config {
    pub num_procs: u32,
    pub memory_size: usize,
    pub page_size: usize,
    pub num_locks: u32,
    pub num_barriers: u32,
    pub bootstrap_endpoint: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(DsmError::Configuration(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.memory_size % self.page_size != 0 {
            return Err(DsmError::Configuration(format!(
                "memory size {} is not a multiple of page size {}",
                self.memory_size, self.page_size
            )));
        }
        if self.num_procs == 0 {
            return Err(DsmError::Configuration("num_procs must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_procs: 1,
            memory_size: 1 << 20,
            page_size: 4096,
            num_locks: 16,
            num_barriers: 16,
            bootstrap_endpoint: "127.0.0.1:7420".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn non_power_of_two_page_size_is_rejected() {
        let mut config = Config::default();
        config.page_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_not_a_multiple_of_page_size_is_rejected() {
        let mut config = Config::default();
        config.memory_size = 10;
        config.page_size = 4096;
        assert!(config.validate().is_err());
    }
}
