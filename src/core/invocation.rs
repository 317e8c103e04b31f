//! The uniform call surface handed out by a lookup.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::composition::Resolved;
use crate::core::descriptor::{CallContext, FunctionKind, Shape};
use crate::core::error::{CatalogError, Result};
use crate::core::negotiation::DataConverter;
use crate::core::payload::{Data, Payload, stop_after_error};
use crate::core::telemetry::{InvocationEvent, InvocationHooks, Outcome};

/// Decides which invocation errors break a wrapper for good.
///
/// A fatal error is cached and returned by every later call without running anything.
#[derive(Clone, Default)]
pub enum FailurePolicy {
    /// Every failure is recoverable.
    #[default]
    Recoverable,
    /// Errors raised by a user callable are fatal; conversion errors are not.
    FatalOnExecution,
    /// Every failure is fatal.
    FatalOnAny,
    Custom(Arc<dyn Fn(&CatalogError) -> bool + Send + Sync>),
}

impl FailurePolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CatalogError) -> bool + Send + Sync + 'static,
    {
        FailurePolicy::Custom(Arc::new(f))
    }

    pub fn is_fatal(&self, error: &CatalogError) -> bool {
        match self {
            FailurePolicy::Recoverable => false,
            FailurePolicy::FatalOnExecution => {
                matches!(error, CatalogError::FunctionExecution { .. })
            }
            FailurePolicy::FatalOnAny => true,
            FailurePolicy::Custom(f) => f(error),
        }
    }
}

impl fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Recoverable => f.write_str("Recoverable"),
            FailurePolicy::FatalOnExecution => f.write_str("FatalOnExecution"),
            FailurePolicy::FatalOnAny => f.write_str("FatalOnAny"),
            FailurePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Options for [`FunctionCatalog::lookup_with`](crate::FunctionCatalog::lookup_with).
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Media type of incoming payloads; the catalog default when `None`.
    pub input_content_type: Option<String>,
    /// Media type of produced payloads; the catalog default when `None`.
    pub output_content_type: Option<String>,
    pub skip_input_conversion: bool,
    pub skip_output_conversion: bool,
    pub failure_policy: FailurePolicy,
}

impl LookupOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both the input and output media type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        self.input_content_type = Some(content_type.clone());
        self.output_content_type = Some(content_type);
        self
    }

    pub fn input_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.input_content_type = Some(content_type.into());
        self
    }

    pub fn output_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.output_content_type = Some(content_type.into());
        self
    }

    pub fn skip_input_conversion(mut self, skip: bool) -> Self {
        self.skip_input_conversion = skip;
        self
    }

    pub fn skip_output_conversion(mut self, skip: bool) -> Self {
        self.skip_output_conversion = skip;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Lifecycle of a wrapper.
///
/// The state belongs to the wrapper, not to a call: many tasks may share one wrapper, so
/// a finished call, failed or not, leaves it `Ready`. `Fatal` is the only state a failure
/// leaves behind. Per-call outcomes go to the hooks as [`Outcome`]s and are counted by
/// [`failure_count`](FunctionInvocationWrapper::failure_count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvocationState {
    Created = 0,
    Ready = 1,
    Fatal = 2,
}

impl InvocationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InvocationState::Created,
            1 => InvocationState::Ready,
            _ => InvocationState::Fatal,
        }
    }
}

/// What every call of a wrapper shares, streams still being drained included.
struct Lifecycle {
    definition: Arc<str>,
    hooks: Vec<Arc<dyn InvocationHooks>>,
    policy: FailurePolicy,
    fatal: OnceLock<CatalogError>,
    state: AtomicU8,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Lifecycle {
    fn succeeded(&self, event: &InvocationEvent, elapsed: Duration) {
        for hook in &self.hooks {
            hook.after(event, &Outcome::Success, elapsed);
        }
    }

    fn failed(&self, event: &InvocationEvent, err: &CatalogError, elapsed: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        for hook in &self.hooks {
            hook.on_error(event, err);
        }
        let outcome = Outcome::Failure(err.to_string());
        for hook in &self.hooks {
            hook.after(event, &outcome, elapsed);
        }
        if self.policy.is_fatal(err) && self.fatal.set(err.clone()).is_ok() {
            self.state
                .store(InvocationState::Fatal as u8, Ordering::Release);
            log::error!(
                "'{}' failed fatally, later calls fail immediately: {}",
                self.definition,
                err
            );
        }
    }
}

/// Reports a streamed output to the hooks once it fails, ends or is dropped.
struct StreamOutcome {
    lifecycle: Arc<Lifecycle>,
    event: InvocationEvent,
    started: Instant,
    cancellation: CancellationToken,
    reported: bool,
}

impl StreamOutcome {
    fn observe(&mut self, item: &Result<Payload>) {
        let Err(err) = item else { return };
        if self.reported {
            return;
        }
        self.reported = true;
        if !matches!(err, CatalogError::Cancelled(_)) {
            self.lifecycle
                .failed(&self.event, err, self.started.elapsed());
        }
    }
}

impl Drop for StreamOutcome {
    fn drop(&mut self) {
        if !self.reported && !self.cancellation.is_cancelled() {
            self.lifecycle
                .succeeded(&self.event, self.started.elapsed());
        }
    }
}

/// A resolved definition plus its negotiated converters and the catalog's hooks.
///
/// Safe to share between tasks; nothing but atomic counters changes between calls.
pub struct FunctionInvocationWrapper {
    target: Resolved,
    input_converter: Option<DataConverter>,
    output_converter: Option<DataConverter>,
    lifecycle: Arc<Lifecycle>,
}

impl fmt::Debug for FunctionInvocationWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInvocationWrapper")
            .field("definition", &self.lifecycle.definition)
            .field("kind", &self.kind())
            .field("input_converter", &self.input_converter)
            .field("output_converter", &self.output_converter)
            .field("state", &self.state())
            .finish()
    }
}

impl FunctionInvocationWrapper {
    pub(crate) fn new(
        definition: &str,
        target: Resolved,
        hooks: Vec<Arc<dyn InvocationHooks>>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            target,
            input_converter: None,
            output_converter: None,
            lifecycle: Arc::new(Lifecycle {
                definition: Arc::from(definition),
                hooks,
                policy,
                fatal: OnceLock::new(),
                state: AtomicU8::new(InvocationState::Created as u8),
                invocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches the negotiated converters; `None` means no conversion on that side.
    pub(crate) fn with_converters(
        mut self,
        input: Option<DataConverter>,
        output: Option<DataConverter>,
    ) -> Self {
        self.input_converter = input;
        self.output_converter = output;
        self.lifecycle
            .state
            .store(InvocationState::Ready as u8, Ordering::Release);
        self
    }

    pub fn definition(&self) -> &str {
        &self.lifecycle.definition
    }

    pub fn kind(&self) -> FunctionKind {
        self.target.kind()
    }

    pub fn input_shape(&self) -> Option<Shape> {
        self.target.input_shape()
    }

    pub fn output_shape(&self) -> Option<Shape> {
        self.target.output_shape()
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.target, Resolved::Composite(_))
    }

    /// Names of the resolved segments, in call order.
    pub fn function_names(&self) -> Vec<&str> {
        self.target.segments().iter().map(|d| d.name()).collect()
    }

    /// Media type the input is decoded from, when input conversion is active.
    pub fn input_content_type(&self) -> Option<&str> {
        self.input_converter.as_ref().map(DataConverter::content_type)
    }

    /// Media type the output is encoded to, when output conversion is active.
    pub fn output_content_type(&self) -> Option<&str> {
        self.output_converter.as_ref().map(DataConverter::content_type)
    }

    pub fn state(&self) -> InvocationState {
        InvocationState::from_u8(self.lifecycle.state.load(Ordering::Acquire))
    }

    /// The cached error every call returns once the wrapper is fatal.
    pub fn fatal_error(&self) -> Option<&CatalogError> {
        self.lifecycle.fatal.get()
    }

    pub fn invocation_count(&self) -> u64 {
        self.lifecycle.invocations.load(Ordering::Relaxed)
    }

    /// Failed calls so far, a stream that yielded an error included.
    pub fn failure_count(&self) -> u64 {
        self.lifecycle.failures.load(Ordering::Relaxed)
    }

    /// Decodes `input`, calls the target and encodes the result.
    ///
    /// Suppliers ignore `input`; consumers return `Ok(None)`.
    pub async fn invoke(&self, input: Option<Data>) -> Result<Option<Data>> {
        self.invoke_with_cancel(input, &CancellationToken::new())
            .await
    }

    /// Like [`invoke`](Self::invoke), abandoning the call once `cancel` fires.
    ///
    /// The callable sees a child of `cancel` in its context. A cancelled call returns
    /// [`CatalogError::Cancelled`] without output conversion or `after` hooks, and a
    /// returned stream ends when `cancel` fires.
    ///
    /// A returned stream reports to the hooks and the failure policy when it yields its
    /// first error, or with a success once it is exhausted or dropped.
    pub async fn invoke_with_cancel(
        &self,
        input: Option<Data>,
        cancel: &CancellationToken,
    ) -> Result<Option<Data>> {
        let lifecycle = &self.lifecycle;
        if let Some(err) = lifecycle.fatal.get() {
            log::debug!("'{}' is broken, replaying cached failure", lifecycle.definition);
            return Err(err.clone());
        }
        lifecycle.invocations.fetch_add(1, Ordering::Relaxed);

        let event = InvocationEvent {
            invocation_id: Uuid::new_v4(),
            definition: lifecycle.definition.to_string(),
            kind: self.kind(),
        };
        for hook in &lifecycle.hooks {
            hook.before(&event);
        }

        let ctx = CallContext {
            definition: lifecycle.definition.clone(),
            function: String::new(),
            segment: None,
            cancellation: cancel.child_token(),
        };
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(CatalogError::Cancelled(lifecycle.definition.to_string()))
            }
            result = self.run(input, &ctx) => result,
        };

        match result {
            Err(CatalogError::Cancelled(definition)) => {
                log::debug!("Invocation {} of '{}' cancelled", event.invocation_id, definition);
                Err(CatalogError::Cancelled(definition))
            }
            Err(err) => {
                lifecycle.failed(&event, &err, started.elapsed());
                Err(err)
            }
            Ok(Some(Data::Stream(s))) => {
                let mut outcome = StreamOutcome {
                    lifecycle: lifecycle.clone(),
                    event,
                    started,
                    cancellation: ctx.cancellation,
                    reported: false,
                };
                let observed = s.map(move |item| {
                    outcome.observe(&item);
                    item
                });
                Ok(Some(Data::Stream(observed.boxed())))
            }
            Ok(output) => {
                lifecycle.succeeded(&event, started.elapsed());
                Ok(output)
            }
        }
    }

    async fn run(&self, input: Option<Data>, ctx: &CallContext) -> Result<Option<Data>> {
        let input = match (input, &self.input_converter) {
            (Some(data), Some(converter)) if self.kind_takes_input() => {
                let definition = self.definition().to_string();
                Some(converter.decode_data(data, move |source| {
                    CatalogError::InputConversion {
                        definition: definition.clone(),
                        segment: None,
                        source,
                    }
                })?)
            }
            (input, _) => input,
        };

        let output = self.target.call(input, ctx).await?;

        let output = match (output, &self.output_converter) {
            (Some(data), Some(converter)) => {
                let definition = self.definition().to_string();
                Some(converter.encode_data(data, move |source| {
                    CatalogError::OutputConversion {
                        definition: definition.clone(),
                        source,
                    }
                })?)
            }
            (output, _) => output,
        };

        Ok(output.map(|data| match data {
            Data::Stream(s) => Data::Stream(
                stop_after_error(s)
                    .take_until(ctx.cancellation.clone().cancelled_owned())
                    .boxed(),
            ),
            single => single,
        }))
    }

    fn kind_takes_input(&self) -> bool {
        self.target
            .segments()
            .first()
            .is_some_and(|d| d.kind() != FunctionKind::Supplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::composition::{CompositionResolver, parse_definition};
    use crate::core::descriptor::{Callable, FunctionDescriptor};
    use crate::core::negotiation::ContentNegotiator;
    use crate::core::payload::Payload;
    use crate::core::telemetry::MemoryTelemetry;
    use crate::core::type_resolver::TypeResolver;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn wrapper(
        name: &str,
        callable: Callable,
        hooks: Vec<Arc<dyn InvocationHooks>>,
        policy: FailurePolicy,
    ) -> FunctionInvocationWrapper {
        let c = TypeResolver::default().classify(name, &callable, None).unwrap();
        let mut registry = HashMap::new();
        registry.insert(
            name.to_string(),
            Arc::new(FunctionDescriptor {
                name: name.to_string(),
                kind: c.kind,
                input: c.input,
                output: c.output,
                callable,
                opaque: false,
            }),
        );
        let target =
            CompositionResolver::resolve(name, &parse_definition(name), &registry).unwrap();
        let negotiator = ContentNegotiator::default();
        let input = target
            .input_shape()
            .map(|s| negotiator.negotiate(s, "application/json").unwrap());
        let output = target
            .output_shape()
            .map(|s| negotiator.negotiate(s, "application/json").unwrap());
        FunctionInvocationWrapper::new(name, target, hooks, policy).with_converters(input, output)
    }

    #[tokio::test]
    async fn test_invoke_converts_both_ways() {
        let w = wrapper(
            "upper",
            Callable::from_fn(|s: String| s.to_uppercase()),
            vec![],
            FailurePolicy::default(),
        );
        assert_eq!(w.state(), InvocationState::Ready);
        let out = w.invoke(Some(Data::from("\"oleg\""))).await.unwrap().unwrap();
        assert_eq!(out.into_single(), Some(Payload::from("\"OLEG\"")));
        assert_eq!(w.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_execution_error_is_recoverable_by_default() {
        let w = wrapper(
            "parse",
            Callable::try_from_fn(|s: String| s.parse::<u32>().map(|n| n.to_string())),
            vec![],
            FailurePolicy::default(),
        );
        let err = w.invoke(Some(Data::from("\"x\""))).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::FunctionExecution { ref function, .. } if function == "parse"
        ));
        assert!(w.invoke(Some(Data::from("\"7\""))).await.is_ok());
        assert_eq!(w.failure_count(), 1);
        assert_eq!(w.state(), InvocationState::Ready);
    }

    #[tokio::test]
    async fn test_fatal_error_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let w = wrapper(
            "broken",
            Callable::try_from_fn(move |_: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>("always fails")
            }),
            vec![],
            FailurePolicy::FatalOnExecution,
        );
        let first = w.invoke(Some(Data::from("\"a\""))).await.unwrap_err();
        let second = w.invoke(Some(Data::from("\"b\""))).await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.state(), InvocationState::Fatal);
        assert!(w.fatal_error().is_some());
    }

    #[tokio::test]
    async fn test_conversion_error_not_fatal_on_execution_policy() {
        let w = wrapper(
            "record",
            Callable::from_fn(|v: serde_json::Value| v),
            vec![],
            FailurePolicy::FatalOnExecution,
        );
        let err = w.invoke(Some(Data::from("{oops"))).await.unwrap_err();
        assert!(matches!(err, CatalogError::InputConversion { .. }));
        assert_eq!(w.state(), InvocationState::Ready);
    }

    #[tokio::test]
    async fn test_hooks_see_outcome() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let w = wrapper(
            "upper",
            Callable::from_fn(|s: String| s.to_uppercase()),
            vec![telemetry.clone() as Arc<dyn InvocationHooks>],
            FailurePolicy::default(),
        );
        w.invoke(Some(Data::from("\"a\""))).await.unwrap();
        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(records[0].definition, "upper");
    }

    #[tokio::test]
    async fn test_cancelled_call_skips_after_hooks() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let w = wrapper(
            "upper",
            Callable::from_fn(|s: String| s.to_uppercase()),
            vec![telemetry.clone() as Arc<dyn InvocationHooks>],
            FailurePolicy::FatalOnAny,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = w
            .invoke_with_cancel(Some(Data::from("\"a\"")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Cancelled(_)));
        assert!(telemetry.records().is_empty());
        // Cancellation is never cached as fatal
        assert_eq!(w.state(), InvocationState::Ready);
    }

    #[tokio::test]
    async fn test_state_is_per_wrapper_not_per_call() {
        let w = wrapper(
            "parse",
            Callable::try_from_fn(|s: String| s.parse::<u32>().map(|n| n.to_string())),
            vec![],
            FailurePolicy::default(),
        );
        w.invoke(Some(Data::from("\"1\""))).await.unwrap();
        assert_eq!(w.state(), InvocationState::Ready);
        w.invoke(Some(Data::from("\"x\""))).await.unwrap_err();
        assert_eq!(w.state(), InvocationState::Ready);
        assert_eq!(w.invocation_count(), 2);
        assert_eq!(w.failure_count(), 1);
        assert!(w.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_stream_outcome_reported_once_drained() {
        use futures::stream::BoxStream;

        let telemetry = Arc::new(MemoryTelemetry::new());
        let w = wrapper(
            "shout",
            Callable::from_stream_fn(|s: BoxStream<'static, String>| {
                s.map(|v| v.to_uppercase()).boxed()
            }),
            vec![telemetry.clone() as Arc<dyn InvocationHooks>],
            FailurePolicy::default(),
        );
        let out = w
            .invoke(Some(Data::stream_of(["\"a\"", "\"b\""])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(telemetry.started(), 1);
        assert!(telemetry.records().is_empty());

        let items = out.collect().await.unwrap();
        assert_eq!(items, vec![Payload::from("\"A\""), Payload::from("\"B\"")]);
        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(w.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_counts_as_failure() {
        use futures::stream::BoxStream;

        let telemetry = Arc::new(MemoryTelemetry::new());
        let w = wrapper(
            "shout",
            Callable::from_stream_fn(|s: BoxStream<'static, String>| {
                s.map(|v| v.to_uppercase()).boxed()
            }),
            vec![telemetry.clone() as Arc<dyn InvocationHooks>],
            FailurePolicy::default(),
        );
        let out = w
            .invoke(Some(Data::stream_of([
                Payload::from("\"a\""),
                Payload::from(vec![0xff, 0xfe]),
                Payload::from("\"c\""),
            ])))
            .await
            .unwrap()
            .unwrap();
        let err = out.collect().await.unwrap_err();
        assert!(matches!(err, CatalogError::InputConversion { .. }));

        let records = telemetry.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].outcome, Outcome::Failure(_)));
        assert_eq!(w.failure_count(), 1);
        assert_eq!(w.state(), InvocationState::Ready);
    }

    #[tokio::test]
    async fn test_supplier_ignores_input() {
        let w = wrapper(
            "hello",
            Callable::from_supplier(|| "hi".to_string()),
            vec![],
            FailurePolicy::default(),
        );
        assert!(w.input_content_type().is_none());
        let out = w.invoke(Some(Data::from("ignored"))).await.unwrap().unwrap();
        assert_eq!(out.into_single(), Some(Payload::from("\"hi\"")));
    }
}
