//! Process-wide initialization.
//!
//! A [`Runtime`] installs the [`Config`], the optional log subscriber and
//! the `SIGPIPE` disposition. Runtimes are reference counted: a second
//! [`Runtime::init`] while one is alive joins it, and teardown happens when
//! the last one drops.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use once_cell::sync::Lazy;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{Config, Error, Result};

static ACTIVE: Lazy<Mutex<Weak<RuntimeInner>>> = Lazy::new(|| Mutex::new(Weak::new()));
static FALLBACK: Lazy<Arc<Config>> = Lazy::new(|| Arc::new(Config::default()));

struct RuntimeInner {
    config: Arc<Config>,
    #[cfg(unix)]
    previous_sigpipe: Option<libc::sighandler_t>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(previous) = self.previous_sigpipe.take() {
            // SAFETY: restores the disposition that was in place before init
            unsafe {
                libc::signal(libc::SIGPIPE, previous);
            }
        }
        tracing::debug!("runtime torn down");
    }
}

/// A reference to the process-wide runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Initializes with [`Config::default`] plus environment overrides.
    pub fn init_default() -> Result<Self> {
        Self::init(Config::default().with_env_overrides()?)
    }

    /// Initializes the runtime, or joins the one that is already alive. In
    /// the latter case `config` is ignored.
    pub fn init(config: Config) -> Result<Self> {
        let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(inner) = active.upgrade() {
            if *inner.config != config {
                tracing::debug!("runtime already initialized, keeping its configuration");
            }
            return Ok(Self { inner });
        }

        if let Some(filter) = &config.log_filter {
            install_subscriber(filter)?;
        }

        #[cfg(unix)]
        let previous_sigpipe = if config.ignore_sigpipe {
            // SAFETY: SIG_IGN is always a valid disposition for SIGPIPE
            let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
            (previous != libc::SIG_ERR).then_some(previous)
        } else {
            None
        };

        let inner = Arc::new(RuntimeInner {
            config: Arc::new(config),
            #[cfg(unix)]
            previous_sigpipe,
        });
        *active = Arc::downgrade(&inner);
        tracing::debug!(config = ?inner.config, "runtime initialized");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether a runtime is currently alive in this process.
    pub fn is_active() -> bool {
        ACTIVE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strong_count()
            > 0
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// The configuration of the live runtime, or the defaults when there is
/// none.
pub(crate) fn active_config() -> Arc<Config> {
    let active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    match active.upgrade() {
        Some(inner) => inner.config.clone(),
        None => FALLBACK.clone(),
    }
}

fn install_subscriber(filter: &str) -> Result<()> {
    let filter_layer = EnvFilter::try_new(filter)
        .map_err(|err| Error::invalid(format!("invalid log filter '{filter}': {err}")))?;
    let fmt_layer = tracing_fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .compact();

    // Embedders may already have their own subscriber
    if tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("a global subscriber is already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portos_types::Errno;

    #[test]
    #[serial_test::serial]
    fn runtimes_are_shared_until_the_last_drops() {
        let config = Config {
            buffer_size: 99,
            ..Config::default()
        };
        let first = Runtime::init(config).unwrap();
        let second = Runtime::init(Config::default()).unwrap();
        assert_eq!(second.config().buffer_size, 99);
        assert_eq!(active_config().buffer_size, 99);
        assert!(Runtime::is_active());

        drop(first);
        assert!(Runtime::is_active());
        drop(second);
        assert!(!Runtime::is_active());
        assert_eq!(active_config().buffer_size, 1024);
    }

    #[test]
    #[serial_test::serial]
    fn bad_log_filters_are_rejected() {
        let config = Config {
            log_filter: Some("portos=loud".to_string()),
            ..Config::default()
        };
        let err = Runtime::init(config).unwrap_err();
        assert_eq!(err.code(), Errno::Inval);
        assert!(!Runtime::is_active());
    }
}
