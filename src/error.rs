//! Crate-wide error type. Variants map install/runtime failures to HTTP
//! status codes so axum handlers can return them directly.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum ModuleError {
    #[error("manifest.json not found")]
    ManifestNotFound,

    #[error("invalid manifest.json: {0}")]
    ManifestFormat(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("archive rejected: {0}")]
    Archive(String),

    #[error("required tool '{0}' was not found in PATH")]
    DependencyMissing(String),

    #[error("install hook failed: {0}")]
    Hook(String),

    #[error("entrypoint '{0}' not found")]
    EntrypointMissing(String),

    #[error("failed to start process: {0}")]
    Start(String),

    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("module '{0}' is not available")]
    Unavailable(String),

    #[error("module '{0}' has no HTTP port")]
    NoPort(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ManifestNotFound
            | Self::EntrypointMissing(_)
            | Self::NotFound(_)
            | Self::TaskNotFound(_) => StatusCode::NOT_FOUND,
            Self::ManifestFormat(_) | Self::Validation { .. } | Self::Archive(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::DependencyMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoPort(_) => StatusCode::BAD_GATEWAY,
            Self::Fetch(_) | Self::Hook(_) | Self::Start(_) | Self::Store(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine readable error code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ManifestNotFound => "MANIFEST_NOT_FOUND",
            Self::ManifestFormat(_) => "MANIFEST_FORMAT",
            Self::Validation { .. } => "VALIDATION",
            Self::Fetch(_) => "FETCH_FAILED",
            Self::Archive(_) => "ARCHIVE_REJECTED",
            Self::DependencyMissing(_) => "DEPENDENCY_MISSING",
            Self::Hook(_) => "HOOK_FAILED",
            Self::EntrypointMissing(_) => "ENTRYPOINT_MISSING",
            Self::Start(_) => "START_FAILED",
            Self::NotFound(_) => "MODULE_NOT_FOUND",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::Unavailable(_) => "MODULE_UNAVAILABLE",
            Self::NoPort(_) => "NO_HTTP_PORT",
            Self::Store(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl From<rusqlite::Error> for ModuleError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl axum::response::IntoResponse for ModuleError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
