//! # Function Catalog
//!
//! A registry of functions, suppliers and consumers that resolves definitions such as
//! `"lower|reverse"` into a single invocable unit, negotiates content-type conversion and
//! wraps every call with uniform error handling and lifecycle hooks.
//!
//! ## Features
//!
//! - **Composition**: chain registered functions with `|`, validated at lookup time
//! - **Scalar & Stream**: callables take and return single values or ordered streams
//! - **Content Negotiation**: JSON, text and raw bytes out of the box, custom converters pluggable
//! - **Typed Registration**: plain closures become callables, shapes inferred from their types
//! - **Observability Hooks**: `before`/`after`/`on_error` for whatever tracing you use
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use function_catalog::prelude::*;
//!
//! # async fn run() -> Result<(), CatalogError> {
//! let catalog = FunctionCatalog::new();
//! catalog.register("lower", Callable::from_fn(|s: String| s.to_lowercase()), None)?;
//! catalog.register(
//!     "reverse",
//!     Callable::from_fn(|s: String| s.chars().rev().collect::<String>()),
//!     None,
//! )?;
//!
//! let wrapper = catalog.lookup("lower|reverse", Some("application/json"))?;
//! let out = wrapper.invoke(Some(Data::from("\"ABC\""))).await?;
//! assert_eq!(out.and_then(Data::into_single), Some(Payload::from("\"cba\"")));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`prelude`]: Commonly used types and traits (import with `use function_catalog::prelude::*`)
//! - [`negotiation`]: Converters and the content negotiator, for custom media types
//! - [`telemetry`]: Invocation hooks and the in-memory collector

// ============================================================================
// Core Module
// ============================================================================

mod core;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

// Registry
pub use crate::core::catalog::{CatalogStats, FunctionCatalog, FunctionDescription};
pub use crate::core::config::CatalogConfig;

// Callables and their metadata
pub use crate::core::descriptor::{
    CallContext, Callable, ConsumerLogic, ElementType, FunctionDescriptor, FunctionKind,
    FunctionLogic, Shape, ShapeHint, SupplierLogic,
};
pub use crate::core::payload::{Data, Element, Payload, PayloadStream, RecordValue};
pub use crate::core::type_resolver::{Classification, ShapeSource, TypeResolver};

// Composition and invocation
pub use crate::core::composition::{
    CompositeInvocable, CompositionResolver, Resolved, parse_definition,
};
pub use crate::core::invocation::{
    FailurePolicy, FunctionInvocationWrapper, InvocationState, LookupOptions,
};
pub use crate::core::routing::{Message, RoutingFunction};

// Errors
pub use crate::core::error::{BoxError, CatalogError, ConversionError, Result};

/// Converters and content negotiation.
pub mod negotiation {
    pub use crate::core::negotiation::{
        APPLICATION_JSON, BytesConverter, ContentNegotiator, Converter, ConverterFactory,
        DataConverter, IdentityConverter, JsonConverter, OCTET_STREAM, TEXT_PLAIN, TextConverter,
        media_type,
    };
}

/// Lifecycle hooks and the in-memory collector.
pub mod telemetry {
    pub use crate::core::telemetry::{
        InvocationEvent, InvocationHooks, InvocationRecord, MemoryTelemetry, Outcome,
    };
}

// ============================================================================
// Prelude Module - Convenient Bulk Imports
// ============================================================================

/// The main prelude: everything needed to register, look up and invoke functions.
///
/// # Example
/// ```rust
/// use function_catalog::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        // Callables
        CallContext,
        Callable,
        // Registry
        CatalogConfig,
        // Errors
        CatalogError,
        ConsumerLogic,
        // Values
        Data,
        ElementType,
        FailurePolicy,
        FunctionCatalog,
        FunctionInvocationWrapper,
        FunctionKind,
        FunctionLogic,
        LookupOptions,
        Message,
        Payload,
        RoutingFunction,
        Shape,
        ShapeHint,
        SupplierLogic,
    };
    pub use crate::telemetry::{InvocationHooks, MemoryTelemetry};
}

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use bytes::Bytes;
pub use serde_json::Value as JsonValue;
pub use tokio_util::sync::CancellationToken;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
