use std::env;

/// What happens to an error no handler in the scope chain accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ErrorPolicy {
    /// Log the failure with its source trail and stop the evaluation.
    FailFast,
    /// Hand the error back to the embedding caller.
    #[default]
    Propagate,
    /// Turn the error into an error value and keep going.
    ErrorValue,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub error_policy: ErrorPolicy,
    pub max_recursion_depth: usize,
    pub worker_threads: usize,
    /// Trace scope lifecycle and variable writes.
    pub debug_scope: bool,
    /// Trace listener registration and notification.
    pub debug_events: bool,
    pub learn_types: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::default(),
            max_recursion_depth: 200,
            worker_threads: default_workers(),
            debug_scope: false,
            debug_events: false,
            learn_types: true,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl RuntimeConfig {
    /// Defaults overridden by `RIPPLE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_flag("RIPPLE_FAIL_FAST") {
            config.error_policy = ErrorPolicy::FailFast;
        }
        config.debug_scope = env_flag("RIPPLE_DEBUG_SCOPE");
        config.debug_events = env_flag("RIPPLE_DEBUG_EVENTS");
        if let Some(workers) = env::var("RIPPLE_WORKERS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            config.worker_threads = workers;
        }
        if let Some(depth) = env::var("RIPPLE_MAX_DEPTH")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            config.max_recursion_depth = depth;
        }
        config
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
        })
        .unwrap_or(false)
}

/// Options applied while building an expression graph from source.
#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    /// Parse the whole input as a pure expression.
    pub pure: bool,
    /// Evaluate collections in parallel when the script is fixed.
    pub parallel: bool,
    pub source_name: Option<String>,
}

impl ParserOptions {
    pub fn pure() -> Self {
        ParserOptions {
            pure: true,
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        ParserOptions {
            source_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn source_name(&self) -> &str {
        self.source_name.as_deref().unwrap_or("<input>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_propagates() {
        let config = RuntimeConfig::default();
        assert_eq!(config.error_policy, ErrorPolicy::Propagate);
        assert!(config.worker_threads > 0);
    }

    #[test]
    fn workers_never_zero() {
        assert_eq!(RuntimeConfig::default().with_workers(0).worker_threads, 1);
    }

    #[test]
    fn parser_options_default_name() {
        assert_eq!(ParserOptions::default().source_name(), "<input>");
        assert_eq!(ParserOptions::named("x.rp").source_name(), "x.rp");
    }
}
