use std::path::PathBuf;

pub const LOG_ENV: &str = "GRADEBOOKD_LOG";
pub const WORKSPACE_ENV: &str = "GRADEBOOKD_WORKSPACE";
const FALLBACK_LOG_ENV: &str = "RUST_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// Process-level settings. Anything scoped to a workspace lives in its
/// `settings` table instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let log_filter = non_empty(LOG_ENV)
            .or_else(|| non_empty(FALLBACK_LOG_ENV))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let workspace = non_empty(WORKSPACE_ENV).map(PathBuf::from);
        Self {
            log_filter,
            workspace,
        }
    }
}
