//! Resolution of definitions such as `"a|b|c"` into a single invocable unit.
//!
//! A composite is just an ordered list of registered descriptors: segment 1 receives the
//! input, every following segment receives the output of the one before it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::StreamExt;

use crate::core::descriptor::{
    CallContext, Callable, ConsumerLogic, ElementType, FunctionDescriptor, FunctionKind,
    FunctionLogic, Shape,
};
use crate::core::error::{CatalogError, ConversionError, Result};
use crate::core::payload::Data;

/// Separator between the names of a composition.
pub const COMPOSITION_SEPARATOR: char = '|';

/// Splits a definition into trimmed segment names. `,` is accepted as a separator too.
///
/// Returns an empty vector for a blank definition.
pub fn parse_definition(definition: &str) -> Vec<String> {
    let normalized = definition.replace(',', "|");
    if normalized.trim().is_empty() {
        return Vec::new();
    }
    normalized
        .split(COMPOSITION_SEPARATOR)
        .map(|s| s.trim().to_string())
        .collect()
}

/// Two or more descriptors invoked in sequence. Built per lookup, never registered.
#[derive(Debug, Clone)]
pub struct CompositeInvocable {
    definition: String,
    segments: Vec<Arc<FunctionDescriptor>>,
    kind: FunctionKind,
}

impl CompositeInvocable {
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn segments(&self) -> &[Arc<FunctionDescriptor>] {
        &self.segments
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }
}

/// A resolved definition: the sole descriptor, or a composite of several.
#[derive(Debug, Clone)]
pub enum Resolved {
    Single(Arc<FunctionDescriptor>),
    Composite(CompositeInvocable),
}

impl Resolved {
    pub fn kind(&self) -> FunctionKind {
        match self {
            Resolved::Single(d) => d.kind(),
            Resolved::Composite(c) => c.kind,
        }
    }

    pub fn segments(&self) -> &[Arc<FunctionDescriptor>] {
        match self {
            Resolved::Single(d) => std::slice::from_ref(d),
            Resolved::Composite(c) => &c.segments,
        }
    }

    /// Input shape of the first segment; `None` when it is a supplier.
    pub fn input_shape(&self) -> Option<Shape> {
        self.segments().first().and_then(|d| d.input_shape())
    }

    /// Output shape of the last segment; `None` when it is a consumer.
    pub fn output_shape(&self) -> Option<Shape> {
        self.segments().last().and_then(|d| d.output_shape())
    }

    /// Runs every segment in order, feeding each output into the next input.
    pub(crate) async fn call(
        &self,
        input: Option<Data>,
        base: &CallContext,
    ) -> Result<Option<Data>> {
        match self {
            Resolved::Single(d) => {
                let ctx = CallContext {
                    function: d.name().to_string(),
                    segment: None,
                    ..base.clone()
                };
                call_segment(d, input, &ctx).await
            }
            Resolved::Composite(c) => {
                let mut data = input;
                for (i, segment) in c.segments.iter().enumerate() {
                    if base.cancellation.is_cancelled() {
                        return Err(CatalogError::Cancelled(c.definition.clone()));
                    }
                    let ctx = CallContext {
                        function: segment.name().to_string(),
                        segment: Some(i + 1),
                        ..base.clone()
                    };
                    data = call_segment(segment, data, &ctx).await?;
                }
                Ok(data)
            }
        }
    }
}

pub struct CompositionResolver;

impl CompositionResolver {
    /// Resolves `names` against `registry`, validating every adjacent pair left to right.
    ///
    /// A single name resolves to its descriptor without a composite around it.
    pub fn resolve(
        definition: &str,
        names: &[String],
        registry: &HashMap<String, Arc<FunctionDescriptor>>,
    ) -> Result<Resolved> {
        if names.is_empty() || names.iter().any(|n| n.is_empty()) {
            return Err(CatalogError::EmptyDefinition);
        }
        let segments = names
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CatalogError::UnknownFunction(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        if segments.len() == 1 {
            return Ok(Resolved::Single(segments[0].clone()));
        }

        for (i, pair) in segments.windows(2).enumerate() {
            validate_boundary(definition, i + 1, &pair[0], &pair[1])?;
        }

        let first = segments[0].kind();
        let last = segments[segments.len() - 1].kind();
        let kind = if last == FunctionKind::Consumer {
            FunctionKind::Consumer
        } else if first == FunctionKind::Supplier {
            FunctionKind::Supplier
        } else {
            FunctionKind::Function
        };
        log::debug!(
            "Composed '{}' from {} segments as {}",
            definition,
            segments.len(),
            kind
        );
        Ok(Resolved::Composite(CompositeInvocable {
            definition: definition.to_string(),
            segments,
            kind,
        }))
    }
}

fn validate_boundary(
    definition: &str,
    boundary: usize,
    upstream: &FunctionDescriptor,
    downstream: &FunctionDescriptor,
) -> Result<()> {
    let incompatible = |reason: String| CatalogError::IncompatibleComposition {
        definition: definition.to_string(),
        boundary,
        reason,
    };
    if upstream.kind() == FunctionKind::Consumer {
        return Err(incompatible(format!(
            "consumer '{}' produces no output and must be the last segment",
            upstream.name()
        )));
    }
    if downstream.kind() == FunctionKind::Supplier {
        return Err(incompatible(format!(
            "supplier '{}' takes no input and must be the first segment",
            downstream.name()
        )));
    }
    if upstream.is_opaque() || downstream.is_opaque() {
        return Ok(());
    }
    match (upstream.output_shape(), downstream.input_shape()) {
        (Some(out), Some(inp)) if out.stream != inp.stream => Err(incompatible(format!(
            "'{}' produces {} but '{}' expects {}",
            upstream.name(),
            describe_cardinality(out),
            downstream.name(),
            describe_cardinality(inp)
        ))),
        _ => Ok(()),
    }
}

fn describe_cardinality(shape: Shape) -> &'static str {
    if shape.stream {
        "a stream"
    } else {
        "a single value"
    }
}

fn missing_input(ctx: &CallContext, shape: Option<Shape>) -> CatalogError {
    CatalogError::InputConversion {
        definition: ctx.definition.to_string(),
        segment: ctx.segment,
        source: ConversionError::Incompatible {
            from: "no input".to_string(),
            to: shape.map(|s| s.element).unwrap_or(ElementType::Unknown),
        },
    }
}

/// Coerces the elements of `data` into the segment's declared element type.
fn coerce_input(data: Data, descriptor: &FunctionDescriptor, ctx: &CallContext) -> Result<Data> {
    let element = match descriptor.input_shape() {
        Some(shape) if !descriptor.is_opaque() => shape.element,
        _ => return Ok(data),
    };
    let wrap = {
        let definition = ctx.definition.to_string();
        let segment = ctx.segment;
        move |source: ConversionError| CatalogError::InputConversion {
            definition: definition.clone(),
            segment,
            source,
        }
    };
    match data {
        Data::Single(p) => p.coerce(element).map(Data::Single).map_err(wrap),
        Data::Stream(s) => Ok(Data::Stream(
            s.map(move |item| item.and_then(|p| p.coerce(element).map_err(&wrap)))
                .boxed(),
        )),
    }
}

async fn call_segment(
    descriptor: &FunctionDescriptor,
    input: Option<Data>,
    ctx: &CallContext,
) -> Result<Option<Data>> {
    match descriptor.callable() {
        Callable::Supplier(logic) => logic
            .get(ctx.clone())
            .await
            .map(Some)
            .map_err(|e| ctx.execution_error(e)),
        Callable::Function(logic) => {
            let input = input.ok_or_else(|| missing_input(ctx, descriptor.input_shape()))?;
            let input = coerce_input(input, descriptor, ctx)?;
            apply_function(logic, descriptor, input, ctx).await.map(Some)
        }
        Callable::Consumer(logic) => {
            match input {
                Some(input) => {
                    let input = coerce_input(input, descriptor, ctx)?;
                    accept_consumer(logic, descriptor, input, ctx).await?;
                }
                // Only a supplier|...|consumer chain reaches a consumer without input
                None => return Err(missing_input(ctx, descriptor.input_shape())),
            }
            Ok(None)
        }
    }
}

async fn apply_function(
    logic: &Arc<dyn FunctionLogic>,
    descriptor: &FunctionDescriptor,
    input: Data,
    ctx: &CallContext,
) -> Result<Data> {
    let wants_stream = descriptor.input_shape().is_some_and(|s| s.stream);
    match input {
        // Scalar function over a stream: apply element by element
        Data::Stream(s) if !wants_stream && !descriptor.is_opaque() => {
            let logic = logic.clone();
            let ctx = ctx.clone();
            Ok(Data::Stream(
                s.then(move |item| {
                    let logic = logic.clone();
                    let ctx = ctx.clone();
                    async move {
                        let p = item?;
                        match logic
                            .apply(Data::Single(p), ctx.clone())
                            .await
                            .map_err(|e| ctx.execution_error(e))?
                        {
                            Data::Single(out) => Ok(out),
                            Data::Stream(_) => Err(ctx.execution_error(
                                "function declared a single output but returned a stream".into(),
                            )),
                        }
                    }
                })
                .boxed(),
            ))
        }
        Data::Single(p) if wants_stream && !descriptor.is_opaque() => logic
            .apply(Data::Stream(Data::Single(p).into_stream()), ctx.clone())
            .await
            .map_err(|e| ctx.execution_error(e)),
        input => logic
            .apply(input, ctx.clone())
            .await
            .map_err(|e| ctx.execution_error(e)),
    }
}

async fn accept_consumer(
    logic: &Arc<dyn ConsumerLogic>,
    descriptor: &FunctionDescriptor,
    input: Data,
    ctx: &CallContext,
) -> Result<()> {
    let wants_stream = descriptor.input_shape().is_some_and(|s| s.stream);
    match input {
        Data::Stream(mut s) if !wants_stream && !descriptor.is_opaque() => {
            while let Some(item) = s.next().await {
                logic
                    .accept(Data::Single(item?), ctx.clone())
                    .await
                    .map_err(|e| ctx.execution_error(e))?;
            }
            Ok(())
        }
        Data::Single(p) if wants_stream && !descriptor.is_opaque() => logic
            .accept(Data::Stream(Data::Single(p).into_stream()), ctx.clone())
            .await
            .map_err(|e| ctx.execution_error(e)),
        input => logic
            .accept(input, ctx.clone())
            .await
            .map_err(|e| ctx.execution_error(e)),
    }
}
