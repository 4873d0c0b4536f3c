use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes cleanly so the embedding host gets structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution context already exists for account {0}")]
    DuplicateContext(String),

    #[error("Scheduled task already exists for account {0}")]
    DuplicateTask(String),

    #[error("Execution context not found: {0}")]
    ContextNotFound(String),

    #[error("Scheduled task not found: {0}")]
    TaskNotFound(String),

    #[error("Page driver error: {0}")]
    Driver(String),

    #[error("Navigation timed out after {0} ms")]
    NavigationTimeout(u64),

    #[error("Sync failed: {0}")]
    SyncFailure(String),

    #[error("Store error: {0}")]
    StoreFailure(String),

    #[error("{0}")]
    Internal(String),
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Background task failed: {e}"))
    }
}

impl AppError {
    /// Stable machine-readable discriminant, used for serialization and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Config(_) => "config",
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::DuplicateContext(_) => "duplicate_context",
            AppError::DuplicateTask(_) => "duplicate_task",
            AppError::ContextNotFound(_) => "context_not_found",
            AppError::TaskNotFound(_) => "task_not_found",
            AppError::Driver(_) => "driver",
            AppError::NavigationTimeout(_) => "navigation_timeout",
            AppError::SyncFailure(_) => "sync_failure",
            AppError::StoreFailure(_) => "store_failure",
            AppError::Internal(_) => "internal",
        }
    }
}

/// We serialize as `{ error: "...", kind: "..." }` for host consumption.
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_kind() {
        let err = AppError::DuplicateContext("xhs:a1".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "duplicate_context");
        assert_eq!(
            json["error"],
            "Execution context already exists for account xhs:a1"
        );
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let parsed: Result<toml::Value, _> = toml::from_str("not = [valid");
        let err: AppError = parsed.unwrap_err().into();
        assert_eq!(err.kind(), "config");
    }
}
