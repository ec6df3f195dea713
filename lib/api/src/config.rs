use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding [`Config::buffer_size`].
pub const ENV_BUFFER_SIZE: &str = "PORTOS_BUFFER_SIZE";
/// Environment variable overriding [`Config::log_filter`].
pub const ENV_LOG: &str = "PORTOS_LOG";

/// Process-wide tunables, installed by [`Runtime::init`](crate::Runtime::init).
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Size of the read buffer behind every stream handle.
    pub buffer_size: usize,
    /// Capacity used by [`pollset_default`](crate::net::pollset_default).
    pub pollset_capacity: usize,
    /// Capacity used by [`thread_queue_default`](crate::thread::thread_queue_default).
    pub queue_capacity: usize,
    /// Stack size for threads started by [`thread_create`](crate::thread::thread_create).
    pub thread_stack_size: Option<usize>,
    /// Ignore `SIGPIPE` while a runtime is alive so that writing to a dead
    /// peer fails with `EPIPE` instead of killing the process.
    pub ignore_sigpipe: bool,
    /// A `tracing-subscriber` filter directive such as `"portos=debug"`.
    /// When set, the runtime installs a formatting subscriber.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            pollset_capacity: 16,
            queue_capacity: 1,
            thread_stack_size: None,
            ignore_sigpipe: true,
            log_filter: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)
            .map_err(|err| Error::invalid(format!("failed to parse config TOML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|err| {
            Error::new(
                Error::from(err).code(),
                format!("could not read config at '{}'", path.display()),
            )
        })?;
        Self::from_toml_str(&data)
    }

    /// Applies `PORTOS_BUFFER_SIZE` and `PORTOS_LOG` on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(size) = std::env::var(ENV_BUFFER_SIZE) {
            self.buffer_size = size.trim().parse().map_err(|_| {
                Error::invalid(format!("{ENV_BUFFER_SIZE} must be a byte count, got '{size}'"))
            })?;
        }
        if let Ok(filter) = std::env::var(ENV_LOG) {
            if !filter.is_empty() {
                self.log_filter = Some(filter);
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid("buffer_size must be at least 1"));
        }
        if self.pollset_capacity == 0 {
            return Err(Error::invalid("pollset_capacity must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid("queue_capacity must be at least 1"));
        }
        Ok(())
    }
}
