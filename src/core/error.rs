use std::sync::Arc;

use thiserror::Error;

use crate::core::descriptor::ElementType;

/// Boxed error returned by user callables.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared, cloneable cause of a failed user callable.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

/// Failure of a single encode/decode step inside a converter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("invalid JSON for {content_type}: {message}")]
    Json {
        content_type: String,
        message: String,
    },

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(String),

    #[error("cannot convert {from} into {to}")]
    Incompatible { from: String, to: ElementType },
}

impl ConversionError {
    pub(crate) fn json(content_type: &str, err: serde_json::Error) -> Self {
        ConversionError::Json {
            content_type: content_type.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("function definition is empty")]
    EmptyDefinition,

    #[error("function '{0}' is already registered")]
    DuplicateName(String),

    #[error("incompatible composition '{definition}' at boundary {boundary}: {reason}")]
    IncompatibleComposition {
        definition: String,
        /// 1-based index of the boundary between segment `boundary` and `boundary + 1`.
        boundary: usize,
        reason: String,
    },

    #[error("unable to classify function '{name}': {reason}")]
    Unclassifiable { name: String, reason: String },

    #[error("unsupported content type '{content_type}' for {element} values")]
    UnsupportedContentType {
        content_type: String,
        element: ElementType,
    },

    #[error("input conversion failed for '{definition}'{}: {source}", segment_suffix(.segment))]
    InputConversion {
        definition: String,
        segment: Option<usize>,
        #[source]
        source: ConversionError,
    },

    #[error("output conversion failed for '{definition}': {source}")]
    OutputConversion {
        definition: String,
        #[source]
        source: ConversionError,
    },

    #[error("function '{function}' failed while invoking '{definition}'{}: {source}", segment_suffix(.segment))]
    FunctionExecution {
        definition: String,
        function: String,
        segment: Option<usize>,
        #[source]
        source: SharedError,
    },

    #[error("invocation of '{0}' was cancelled")]
    Cancelled(String),

    #[error("failed to establish route: {0}")]
    Routing(String),
}

fn segment_suffix(segment: &Option<usize>) -> String {
    match segment {
        Some(index) => format!(" (segment {index})"),
        None => String::new(),
    }
}

impl CatalogError {
    /// True for errors raised while resolving a definition, before any wrapper exists.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            CatalogError::UnknownFunction(_)
                | CatalogError::EmptyDefinition
                | CatalogError::IncompatibleComposition { .. }
                | CatalogError::UnsupportedContentType { .. }
                | CatalogError::Unclassifiable { .. }
        )
    }

    /// The composite segment (1-based) the error points at, if any.
    pub fn segment(&self) -> Option<usize> {
        match self {
            CatalogError::InputConversion { segment, .. }
            | CatalogError::FunctionExecution { segment, .. } => *segment,
            CatalogError::IncompatibleComposition { boundary, .. } => Some(*boundary),
            _ => None,
        }
    }
}
