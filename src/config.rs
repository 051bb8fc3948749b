//! Tunables for groups and file channels.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by a [`ChannelGroup`] and the channels created on it.
///
/// Nothing here is read from the environment implicitly; use [`Config::from_env`] to opt in.
///
/// [`ChannelGroup`]: crate::ChannelGroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of completion callbacks invoked directly on one thread's stack before
    /// further callbacks are handed to the pool.
    pub max_handlers_on_stack: usize,

    /// Number of internal threads started by a group created over an elastic pool.
    pub internal_threads: usize,

    /// Number of reclaimed correlation records each channel keeps for reuse.
    pub cached_tokens: usize,

    /// Whether [`AsyncFileChannel::transfer_to`] may use an in-kernel copy.
    ///
    /// [`AsyncFileChannel::transfer_to`]: crate::AsyncFileChannel::transfer_to
    pub fast_file_transfer: bool,

    /// How long a closing channel waits for in-flight operations before failing them.
    pub close_drain_timeout: Duration,

    /// Name prefix given to every thread spawned for this configuration.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_handlers_on_stack: 16,
            internal_threads: 1,
            cached_tokens: 4,
            fast_file_transfer: false,
            close_drain_timeout: Duration::from_millis(50),
            thread_name: String::from("iogroup"),
        }
    }
}

impl Config {
    /// Builds a configuration from `IOGROUP_*` environment variables.
    ///
    /// Recognized variables are `IOGROUP_MAX_HANDLERS_ON_STACK`, `IOGROUP_INTERNAL_THREADS`,
    /// `IOGROUP_CACHED_TOKENS` and `IOGROUP_FAST_FILE_TRANSFER`. Missing or unparsable values
    /// keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(n) = read_var("IOGROUP_MAX_HANDLERS_ON_STACK") {
            config.max_handlers_on_stack = n;
        }
        if let Some(n) = read_var("IOGROUP_INTERNAL_THREADS") {
            config.internal_threads = n;
        }
        if let Some(n) = read_var("IOGROUP_CACHED_TOKENS") {
            config.cached_tokens = n;
        }
        if let Ok(value) = env::var("IOGROUP_FAST_FILE_TRANSFER") {
            // An empty value enables it, the same as a bare flag.
            config.fast_file_transfer = value.is_empty() || value.eq_ignore_ascii_case("true");
        }

        tracing::debug!(?config, "configuration read from environment");
        config
    }
}

fn read_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(name, value = %value, "ignoring unparsable setting");
            None
        }
    }
}
