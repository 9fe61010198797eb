use thiserror::Error;

/// Main error type for the Canopy system
#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Scope construction errors
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error(
        "Multiple children with the same name were passed to a single scope. \
         The offending children are {name}:{existing} and {name}:{duplicate}. \
         Rename one of them to resolve this issue."
    )]
    DuplicateChild {
        name: String,
        existing: String,
        duplicate: String,
    },

    #[error("Invalid scope definition at '{path}': {message}")]
    InvalidDefinition { path: String, message: String },
}

/// Model, result, and value errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "No result with id {result_id} found in this model. \
         Did you generate the hyperparameter values with `Model::generate()`?"
    )]
    ResultNotFound { result_id: String },

    #[error("No model with id {model_id} in this group")]
    ModelNotFound { model_id: String },

    #[error("{kind} {id} is unavailable; the reference was never bound or its owner is gone")]
    ReferentUnavailable { kind: &'static str, id: String },

    #[error("Unknown model strategy: {tag}")]
    UnknownStrategy { tag: String },

    #[error("Malformed {entity}: {message}")]
    Malformed {
        entity: &'static str,
        message: String,
    },
}

/// Hyperparameter domain errors
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Domain at '{path}' has an empty value set")]
    Empty { path: String },

    #[error("Invalid {distribution} parameters: {message}")]
    InvalidDistribution {
        distribution: String,
        message: String,
    },

    #[error("Value {value} is not part of the domain at '{path}'")]
    ValueNotInDomain { value: String, path: String },
}

/// Storage collaborator errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid save path: {path}")]
    InvalidPath { path: String },

    #[error("Could not load models from {path} or any of its checkpoints")]
    NothingToLoad { path: String },
}

/// Result type alias for Canopy operations
pub type CanopyResult<T> = Result<T, CanopyError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CanopyError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CanopyError::Config(format!($($arg)*))
    };
}
