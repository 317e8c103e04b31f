use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::error::{BoxError, CatalogError};
use crate::core::payload::{Data, Element, Payload};

/// Whether a callable maps, consumes or produces values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionKind {
    Function,
    Consumer,
    Supplier,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FunctionKind::Function => "FUNCTION",
            FunctionKind::Consumer => "CONSUMER",
            FunctionKind::Supplier => "SUPPLIER",
        })
    }
}

/// The data shape of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Bytes,
    Text,
    Record,
    /// Erased or generic; accepts any payload without conversion.
    Unknown,
}

impl fmt::Display for ElementType {
    /// Lower-cased simple type names, for display only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ElementType::Bytes => "bytes",
            ElementType::Text => "string",
            ElementType::Record => "record",
            ElementType::Unknown => "object",
        })
    }
}

/// Element type plus scalar/stream classification of one side of a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub element: ElementType,
    pub stream: bool,
}

impl Shape {
    pub const fn scalar(element: ElementType) -> Self {
        Shape {
            element,
            stream: false,
        }
    }

    pub const fn stream(element: ElementType) -> Self {
        Shape {
            element,
            stream: true,
        }
    }
}

/// Explicit shape metadata supplied at registration time.
///
/// Takes precedence over anything the resolver could discover on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeHint {
    pub input: Option<Shape>,
    pub output: Option<Shape>,
}

impl ShapeHint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, shape: Shape) -> Self {
        self.input = Some(shape);
        self
    }

    pub fn output(mut self, shape: Shape) -> Self {
        self.output = Some(shape);
        self
    }
}

/// Per-call information handed to a callable.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The definition the wrapper was looked up with, e.g. `"a|b"`.
    pub definition: Arc<str>,
    /// Name of the registered function being called.
    pub function: String,
    /// 1-based position inside a composite, `None` for a single function.
    pub segment: Option<usize>,
    /// Cancelled when the caller abandons the invocation.
    pub cancellation: CancellationToken,
}

impl CallContext {
    pub(crate) fn execution_error(&self, source: BoxError) -> CatalogError {
        CatalogError::FunctionExecution {
            definition: self.definition.to_string(),
            function: self.function.clone(),
            segment: self.segment,
            source: Arc::from(source),
        }
    }
}

/// A callable taking one input and producing one output.
#[async_trait]
pub trait FunctionLogic: Send + Sync + 'static {
    /// Applies the function. The input matches the declared input shape: a stream for
    /// stream-shaped functions, a single value otherwise.
    async fn apply(&self, input: Data, ctx: CallContext) -> Result<Data, BoxError>;

    /// Declared input and output shapes, when the implementation knows them.
    fn shapes(&self) -> Option<(Shape, Shape)> {
        None
    }

    /// A `fn(Input) -> Output` style signature, used when shapes are not declared.
    fn signature(&self) -> Option<String> {
        None
    }
}

/// A callable producing values without input.
#[async_trait]
pub trait SupplierLogic: Send + Sync + 'static {
    async fn get(&self, ctx: CallContext) -> Result<Data, BoxError>;

    fn output_shape(&self) -> Option<Shape> {
        None
    }

    fn signature(&self) -> Option<String> {
        None
    }
}

/// A callable accepting values without output.
#[async_trait]
pub trait ConsumerLogic: Send + Sync + 'static {
    async fn accept(&self, input: Data, ctx: CallContext) -> Result<(), BoxError>;

    fn input_shape(&self) -> Option<Shape> {
        None
    }

    fn signature(&self) -> Option<String> {
        None
    }
}

/// A registered callable, tagged by kind.
#[derive(Clone)]
pub enum Callable {
    Function(Arc<dyn FunctionLogic>),
    Supplier(Arc<dyn SupplierLogic>),
    Consumer(Arc<dyn ConsumerLogic>),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable::{:?}", self.kind())
    }
}

impl Callable {
    pub fn kind(&self) -> FunctionKind {
        match self {
            Callable::Function(_) => FunctionKind::Function,
            Callable::Supplier(_) => FunctionKind::Supplier,
            Callable::Consumer(_) => FunctionKind::Consumer,
        }
    }

    /// The signature string the callable reports, if any.
    pub fn signature(&self) -> Option<String> {
        match self {
            Callable::Function(l) => l.signature(),
            Callable::Supplier(l) => l.signature(),
            Callable::Consumer(l) => l.signature(),
        }
    }

    pub fn function<L: FunctionLogic>(logic: L) -> Self {
        Callable::Function(Arc::new(logic))
    }

    pub fn supplier<L: SupplierLogic>(logic: L) -> Self {
        Callable::Supplier(Arc::new(logic))
    }

    pub fn consumer<L: ConsumerLogic>(logic: L) -> Self {
        Callable::Consumer(Arc::new(logic))
    }

    /// Wraps an infallible scalar closure, e.g. `|s: String| s.to_uppercase()`.
    pub fn from_fn<I, O, F>(f: F) -> Self
    where
        I: Element,
        O: Element,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        Self::try_from_fn(move |i: I| Ok::<O, std::convert::Infallible>(f(i)))
    }

    /// Wraps a fallible scalar closure; its error surfaces as a function execution error.
    pub fn try_from_fn<I, O, E, F>(f: F) -> Self
    where
        I: Element,
        O: Element,
        E: Into<BoxError> + 'static,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    {
        Callable::function(ScalarFunction {
            f,
            _marker: PhantomData,
        })
    }

    /// Wraps a closure mapping a stream of inputs to a stream of outputs.
    pub fn from_stream_fn<I, O, F>(f: F) -> Self
    where
        I: Element,
        O: Element,
        F: Fn(BoxStream<'static, I>) -> BoxStream<'static, O> + Send + Sync + 'static,
    {
        Callable::function(StreamFunction {
            f,
            _marker: PhantomData,
        })
    }

    pub fn from_supplier<O, F>(f: F) -> Self
    where
        O: Element,
        F: Fn() -> O + Send + Sync + 'static,
    {
        Callable::supplier(ScalarSupplier {
            f,
            _marker: PhantomData,
        })
    }

    /// Wraps a closure producing a finite or unbounded stream.
    pub fn from_stream_supplier<O, F>(f: F) -> Self
    where
        O: Element,
        F: Fn() -> BoxStream<'static, O> + Send + Sync + 'static,
    {
        Callable::supplier(StreamSupplier {
            f,
            _marker: PhantomData,
        })
    }

    pub fn from_consumer<I, F>(f: F) -> Self
    where
        I: Element,
        F: Fn(I) + Send + Sync + 'static,
    {
        Callable::consumer(ScalarConsumer {
            f,
            _marker: PhantomData,
        })
    }
}

/// Metadata about one registered callable. Never mutated, only replaced.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub(crate) name: String,
    pub(crate) kind: FunctionKind,
    pub(crate) input: Option<Shape>,
    pub(crate) output: Option<Shape>,
    pub(crate) callable: Callable,
    pub(crate) opaque: bool,
}

impl FunctionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// `None` for suppliers.
    pub fn input_shape(&self) -> Option<Shape> {
        self.input
    }

    /// `None` for consumers.
    pub fn output_shape(&self) -> Option<Shape> {
        self.output
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    /// True when the shapes could not be classified and no conversion is attempted.
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }
}

// ----------------------------------------------------------------------------
// Typed closure adapters
// ----------------------------------------------------------------------------

fn expect_single(input: Data) -> Result<Payload, BoxError> {
    match input {
        Data::Single(p) => Ok(p),
        Data::Stream(_) => Err("expected a single value but received a stream".into()),
    }
}

/// Converts a stream of payloads into typed elements. The typed stream ends at the first
/// failure, which is parked in `failure` so it can be re-emitted after the outputs.
fn typed_inputs<I: Element>(
    input: Data,
    ctx: CallContext,
    failure: Arc<Mutex<Option<CatalogError>>>,
) -> BoxStream<'static, I> {
    input
        .into_stream()
        .scan((), move |_, item| {
            let converted =
                item.and_then(|p| I::from_payload(p).map_err(|e| ctx.execution_error(e)));
            future::ready(match converted {
                Ok(value) => Some(value),
                Err(err) => {
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                    None
                }
            })
        })
        .boxed()
}

fn with_parked_failure(
    outputs: BoxStream<'static, Result<Payload, CatalogError>>,
    failure: Arc<Mutex<Option<CatalogError>>>,
) -> Data {
    let tail = stream::once(async move {
        failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    })
    .filter_map(|err| future::ready(err.map(Err)));
    Data::Stream(outputs.chain(tail).boxed())
}

struct ScalarFunction<I, O, E, F> {
    f: F,
    _marker: PhantomData<fn(I) -> Result<O, E>>,
}

#[async_trait]
impl<I, O, E, F> FunctionLogic for ScalarFunction<I, O, E, F>
where
    I: Element,
    O: Element,
    E: Into<BoxError> + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
{
    async fn apply(&self, input: Data, _ctx: CallContext) -> Result<Data, BoxError> {
        let value = I::from_payload(expect_single(input)?)?;
        let out = (self.f)(value).map_err(Into::into)?;
        Ok(Data::Single(out.into_payload()))
    }

    fn shapes(&self) -> Option<(Shape, Shape)> {
        Some((Shape::scalar(I::TYPE), Shape::scalar(O::TYPE)))
    }

    fn signature(&self) -> Option<String> {
        Some(std::any::type_name::<fn(I) -> O>().to_string())
    }
}

struct StreamFunction<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<I, O, F> FunctionLogic for StreamFunction<I, O, F>
where
    I: Element,
    O: Element,
    F: Fn(BoxStream<'static, I>) -> BoxStream<'static, O> + Send + Sync + 'static,
{
    async fn apply(&self, input: Data, ctx: CallContext) -> Result<Data, BoxError> {
        let failure = Arc::new(Mutex::new(None));
        let inputs = typed_inputs::<I>(input, ctx, failure.clone());
        let outputs = (self.f)(inputs)
            .map(|o| Ok(o.into_payload()))
            .boxed();
        Ok(with_parked_failure(outputs, failure))
    }

    fn shapes(&self) -> Option<(Shape, Shape)> {
        Some((Shape::stream(I::TYPE), Shape::stream(O::TYPE)))
    }

    fn signature(&self) -> Option<String> {
        let name = std::any::type_name::<fn(BoxStream<'static, I>) -> BoxStream<'static, O>>();
        Some(name.to_string())
    }
}

struct ScalarSupplier<O, F> {
    f: F,
    _marker: PhantomData<fn() -> O>,
}

#[async_trait]
impl<O, F> SupplierLogic for ScalarSupplier<O, F>
where
    O: Element,
    F: Fn() -> O + Send + Sync + 'static,
{
    async fn get(&self, _ctx: CallContext) -> Result<Data, BoxError> {
        Ok(Data::Single((self.f)().into_payload()))
    }

    fn output_shape(&self) -> Option<Shape> {
        Some(Shape::scalar(O::TYPE))
    }

    fn signature(&self) -> Option<String> {
        Some(std::any::type_name::<fn() -> O>().to_string())
    }
}

struct StreamSupplier<O, F> {
    f: F,
    _marker: PhantomData<fn() -> O>,
}

#[async_trait]
impl<O, F> SupplierLogic for StreamSupplier<O, F>
where
    O: Element,
    F: Fn() -> BoxStream<'static, O> + Send + Sync + 'static,
{
    async fn get(&self, _ctx: CallContext) -> Result<Data, BoxError> {
        Ok(Data::Stream(
            (self.f)().map(|o| Ok(o.into_payload())).boxed(),
        ))
    }

    fn output_shape(&self) -> Option<Shape> {
        Some(Shape::stream(O::TYPE))
    }

    fn signature(&self) -> Option<String> {
        Some(std::any::type_name::<fn() -> BoxStream<'static, O>>().to_string())
    }
}

struct ScalarConsumer<I, F> {
    f: F,
    _marker: PhantomData<fn(I)>,
}

#[async_trait]
impl<I, F> ConsumerLogic for ScalarConsumer<I, F>
where
    I: Element,
    F: Fn(I) + Send + Sync + 'static,
{
    async fn accept(&self, input: Data, _ctx: CallContext) -> Result<(), BoxError> {
        (self.f)(I::from_payload(expect_single(input)?)?);
        Ok(())
    }

    fn input_shape(&self) -> Option<Shape> {
        Some(Shape::scalar(I::TYPE))
    }

    fn signature(&self) -> Option<String> {
        Some(std::any::type_name::<fn(I)>().to_string())
    }
}
