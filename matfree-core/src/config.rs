//! Platform settings: thread model, worker thread count and device selection.
//!
//! Settings can be built in code, deserialized with `serde`, or read from the
//! environment (`MATFREE_THREAD_MODEL`, `MATFREE_NUM_THREADS`,
//! `MATFREE_DEVICE_NUMBER`, `MATFREE_DEVICE_COUNT`).

use crate::error::{CoreError, Result};
use cfg_if::cfg_if;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const ENV_THREAD_MODEL: &str = "MATFREE_THREAD_MODEL";
pub const ENV_NUM_THREADS: &str = "MATFREE_NUM_THREADS";
pub const ENV_DEVICE_NUMBER: &str = "MATFREE_DEVICE_NUMBER";
pub const ENV_DEVICE_COUNT: &str = "MATFREE_DEVICE_COUNT";

/// How kernels are executed on the host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadModel {
    /// One worker thread, kernels run sequentially.
    Serial,
    /// Kernels run block-parallel on a thread pool.
    Parallel,
}

impl Default for ThreadModel {
    fn default() -> Self {
        cfg_if! {
            if #[cfg(target_arch = "wasm32")] {
                ThreadModel::Serial
            } else {
                ThreadModel::Parallel
            }
        }
    }
}

impl FromStr for ThreadModel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(ThreadModel::Serial),
            "parallel" | "openmp" => Ok(ThreadModel::Parallel),
            other => Err(CoreError::Config(format!("Unknown thread model '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub thread_model: ThreadModel,
    /// Explicit worker thread count. `None` divides the node's cores evenly
    /// among the ranks sharing it.
    pub num_threads: Option<usize>,
    /// Device used when running with a single rank.
    pub device_number: usize,
    /// Number of devices per node. When set, node-local ranks beyond it wrap around.
    pub device_count: Option<usize>,
}

/// Resolved per-rank device settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub device_id: usize,
    pub num_threads: usize,
}

impl PlatformConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_model(mut self, thread_model: ThreadModel) -> Self {
        self.thread_model = thread_model;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_device_number(mut self, device_number: usize) -> Self {
        self.device_number = device_number;
        self
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from a key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(model) = get(ENV_THREAD_MODEL) {
            config.thread_model = model.parse()?;
        }
        if let Some(threads) = get(ENV_NUM_THREADS) {
            config.num_threads = Some(parse_count(ENV_NUM_THREADS, &threads)?);
        }
        if let Some(device) = get(ENV_DEVICE_NUMBER) {
            config.device_number = parse_count(ENV_DEVICE_NUMBER, &device)?;
        }
        if let Some(count) = get(ENV_DEVICE_COUNT) {
            config.device_count = Some(parse_count(ENV_DEVICE_COUNT, &count)?);
        }
        Ok(config)
    }

    /// Number of kernel threads for one rank, given the node's core count and
    /// how many ranks share the node.
    pub fn resolve_threads(&self, cores: usize, local_size: usize) -> usize {
        let local_size = local_size.max(1);
        let threads = match self.thread_model {
            ThreadModel::Serial => 1,
            ThreadModel::Parallel => match self.num_threads {
                Some(n) => n.max(1),
                None => (cores / local_size).max(1),
            },
        };
        if threads * local_size > cores {
            log::warn!(
                "Oversubscribing CPU: {} ranks x {} threads on {} cores",
                local_size,
                threads,
                cores
            );
        }
        threads
    }

    /// Device id for a rank. A single rank uses the configured device number,
    /// otherwise each node-local rank takes its own device.
    pub fn resolve_device(&self, size: usize, rank: usize, local_rank: usize) -> usize {
        if size <= 1 {
            return self.device_number;
        }
        match self.device_count {
            Some(count) if count > 0 && local_rank >= count => {
                log::warn!(
                    "Rank {} oversubscribing device {}",
                    rank,
                    local_rank % count
                );
                local_rank % count
            }
            _ => local_rank,
        }
    }

    pub fn resolve(
        &self,
        cores: usize,
        size: usize,
        rank: usize,
        local_rank: usize,
        local_size: usize,
    ) -> DeviceSettings {
        DeviceSettings {
            device_id: self.resolve_device(size, rank, local_rank),
            num_threads: self.resolve_threads(cores, local_size),
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| CoreError::Config(format!("{} = '{}': {}", key, value, e)))
}

/// Number of hardware threads visible to this process.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
