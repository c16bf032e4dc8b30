//! Error types for the moduleops control plane
//!
//! Every component returns [`Error`]; the reconciler is the only place that
//! decides whether a failure is retried (see [`Error::is_retriable`]).

use std::time::Duration;

use thiserror::Error;

/// A single values document violation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaValidationError {
    /// Offending field path, e.g. `values.service.ports[0].name`
    pub field: String,
    pub message: String,
}

impl SchemaValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Credentials not found for {reference}: {message}")]
    CredentialsNotFound { reference: String, message: String },

    #[error("Credentials malformed for {reference}: {message}")]
    CredentialsMalformed { reference: String, message: String },

    #[error("Template source {source_url} unreachable: {message}")]
    SourceUnreachable { source_url: String, message: String },

    #[error("Template {template} is invalid: {message}")]
    TemplateInvalid { template: String, message: String },

    #[error("Values failed schema validation: {}", format_violations(.0))]
    SchemaValidationError(Vec<SchemaValidationError>),

    #[error("Render error in {file}: {message}")]
    RenderError { file: String, message: String },

    #[error("Conflict applying {resource}: {message}")]
    ApplyConflict { resource: String, message: String },

    #[error("Push to {repo}@{branch} rejected after retry")]
    GitPushConflict { repo: String, branch: String },

    #[error("Git error: {0}")]
    GitError(String),

    #[error("Reconciliation attempt exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn format_violations(violations: &[SchemaValidationError]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the failed attempt should be requeued with backoff.
    ///
    /// Validation-class failures (credentials, template content, values,
    /// rendering) are terminal: retrying cannot succeed until the Module or
    /// the referenced material changes.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(e) => !matches!(e, kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 || resp.code == 403),
            Error::SourceUnreachable { .. }
            | Error::ApplyConflict { .. }
            | Error::GitPushConflict { .. }
            | Error::GitError(_)
            | Error::Timeout(_)
            | Error::HttpError(_)
            | Error::IoError(_) => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::CredentialsNotFound { .. }
            | Error::CredentialsMalformed { .. }
            | Error::TemplateInvalid { .. }
            | Error::SchemaValidationError(_)
            | Error::RenderError { .. }
            | Error::SerializationError(_)
            | Error::YamlError(_) => false,
        }
    }

    /// Machine-readable reason used for status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesError",
            Error::ConfigError(_) => "ConfigError",
            Error::ValidationError(_) => "ValidationError",
            Error::CredentialsNotFound { .. } => "CredentialsNotFound",
            Error::CredentialsMalformed { .. } => "CredentialsMalformed",
            Error::SourceUnreachable { .. } => "SourceUnreachable",
            Error::TemplateInvalid { .. } => "TemplateInvalid",
            Error::SchemaValidationError(_) => "SchemaValidationError",
            Error::RenderError { .. } => "RenderError",
            Error::ApplyConflict { .. } => "ApplyConflict",
            Error::GitPushConflict { .. } => "GitPushConflict",
            Error::GitError(_) => "GitError",
            Error::Timeout(_) => "Timeout",
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::HttpError(_) => "HttpError",
            Error::IoError(_) => "IoError",
        }
    }

    pub fn unreachable(source_url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::SourceUnreachable {
            source_url: source_url.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_template(template: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::TemplateInvalid {
            template: template.into(),
            message: message.to_string(),
        }
    }

    pub fn render(file: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::RenderError {
            file: file.into(),
            message: message.to_string(),
        }
    }
}
