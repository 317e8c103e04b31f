//! The registry every adapter goes through: registration, lookup and introspection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::composition::{CompositionResolver, Resolved, parse_definition};
use crate::core::config::CatalogConfig;
use crate::core::descriptor::{
    Callable, ElementType, FunctionDescriptor, FunctionKind, Shape, ShapeHint,
};
use crate::core::error::{CatalogError, Result};
use crate::core::invocation::{FunctionInvocationWrapper, LookupOptions};
use crate::core::negotiation::{ContentNegotiator, DataConverter};
use crate::core::telemetry::InvocationHooks;
use crate::core::type_resolver::TypeResolver;

/// Catalog-wide counters.
#[derive(Debug, Default)]
pub struct CatalogStats {
    registrations: AtomicU64,
    lookups: AtomicU64,
    opaque_fallbacks: AtomicU64,
}

impl CatalogStats {
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn opaque_fallbacks(&self) -> u64 {
        self.opaque_fallbacks.load(Ordering::Relaxed)
    }
}

/// Display-only summary of a registered function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FunctionDescription {
    #[serde(rename = "type")]
    pub kind: FunctionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
}

impl From<&FunctionDescriptor> for FunctionDescription {
    fn from(descriptor: &FunctionDescriptor) -> Self {
        let name = |shape: Option<Shape>| shape.map(|s| s.element.to_string());
        Self {
            kind: descriptor.kind(),
            input_type: name(descriptor.input_shape()),
            output_type: name(descriptor.output_shape()),
        }
    }
}

/// Maps names to registered callables and turns definitions into invocation wrappers.
///
/// Share it behind an `Arc`; lookups only take a read lock.
pub struct FunctionCatalog {
    registry: RwLock<HashMap<String, Arc<FunctionDescriptor>>>,
    resolver: TypeResolver,
    negotiator: ContentNegotiator,
    hooks: Vec<Arc<dyn InvocationHooks>>,
    config: CatalogConfig,
    stats: CatalogStats,
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::with_config(CatalogConfig::default())
    }
}

impl FunctionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CatalogConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            resolver: TypeResolver::new(config.unknown_as_stream),
            negotiator: ContentNegotiator::default(),
            hooks: Vec::new(),
            config,
            stats: CatalogStats::default(),
        }
    }

    /// Attaches lifecycle hooks shared by every wrapper this catalog hands out.
    pub fn with_hooks(mut self, hooks: Arc<dyn InvocationHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// Replaces the content negotiator, e.g. one with custom converters registered.
    pub fn with_negotiator(mut self, negotiator: ContentNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn stats(&self) -> &CatalogStats {
        &self.stats
    }

    /// Classifies `callable` and stores it under `name`.
    ///
    /// A later registration under the same name replaces the earlier one unless the
    /// configuration forbids overwrites.
    pub fn register(
        &self,
        name: impl Into<String>,
        callable: Callable,
        hint: Option<ShapeHint>,
    ) -> Result<()> {
        let name = name.into();
        if name.contains(['|', ',']) {
            log::warn!(
                "Function name '{name}' contains a composition separator and cannot be looked up \
                 by name"
            );
        }

        let descriptor = match self.resolver.classify(&name, &callable, hint.as_ref()) {
            Ok(c) => FunctionDescriptor {
                name: name.clone(),
                kind: c.kind,
                input: c.input,
                output: c.output,
                callable,
                opaque: false,
            },
            Err(err) if self.config.allow_opaque => {
                log::warn!("Registering '{name}' as an opaque pass-through: {err}");
                self.stats.opaque_fallbacks.fetch_add(1, Ordering::Relaxed);
                for hook in &self.hooks {
                    hook.on_opaque_fallback(&name, &err);
                }
                let kind = callable.kind();
                let unknown = Shape {
                    element: ElementType::Unknown,
                    stream: self.config.unknown_as_stream,
                };
                FunctionDescriptor {
                    name: name.clone(),
                    kind,
                    input: (kind != FunctionKind::Supplier).then_some(unknown),
                    output: (kind != FunctionKind::Consumer).then_some(unknown),
                    callable,
                    opaque: true,
                }
            }
            Err(err) => return Err(err),
        };

        let kind = descriptor.kind;
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(&name) {
            if !self.config.allow_overwrite {
                return Err(CatalogError::DuplicateName(name));
            }
            log::warn!("Function '{name}' is already registered, replacing it");
        }
        registry.insert(name.clone(), Arc::new(descriptor));
        drop(registry);

        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        log::info!("Registered {kind} '{name}'");
        Ok(())
    }

    /// Resolves `definition` and negotiates `content_type` (the configured default when
    /// `None`) for both input and output.
    pub fn lookup(
        &self,
        definition: &str,
        content_type: Option<&str>,
    ) -> Result<FunctionInvocationWrapper> {
        let options = match content_type {
            Some(ct) => LookupOptions::new().content_type(ct),
            None => LookupOptions::new(),
        };
        self.lookup_with(definition, options)
    }

    pub fn lookup_with(
        &self,
        definition: &str,
        options: LookupOptions,
    ) -> Result<FunctionInvocationWrapper> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let definition = self.effective_definition(definition)?;
        let names = parse_definition(&definition);
        let target = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            CompositionResolver::resolve(&definition, &names, &registry)?
        };

        let input = match (target.input_shape(), target.segments().first()) {
            (Some(shape), Some(first)) if !options.skip_input_conversion && !first.is_opaque() => {
                Some(self.negotiate(shape, options.input_content_type.as_deref())?)
            }
            _ => None,
        };
        let output = match (target.output_shape(), target.segments().last()) {
            (Some(shape), Some(last)) if !options.skip_output_conversion && !last.is_opaque() => {
                Some(self.negotiate(shape, options.output_content_type.as_deref())?)
            }
            _ => None,
        };

        log::debug!(
            "Resolved '{}' as {} {}",
            definition,
            target.kind(),
            if matches!(target, Resolved::Composite(_)) { "composite" } else { "function" }
        );
        let wrapper = FunctionInvocationWrapper::new(
            &definition,
            target,
            self.hooks.clone(),
            options.failure_policy,
        );
        Ok(wrapper.with_converters(input, output))
    }

    fn negotiate(&self, shape: Shape, content_type: Option<&str>) -> Result<DataConverter> {
        let content_type = content_type.unwrap_or(&self.config.default_content_type);
        self.negotiator.negotiate(shape, content_type)
    }

    /// A blank definition falls back to the configured one, then to the only registered
    /// function.
    fn effective_definition(&self, definition: &str) -> Result<String> {
        if !definition.trim().is_empty() {
            return Ok(definition.trim().to_string());
        }
        if let Some(configured) = self.config.definition.as_deref() {
            if !configured.trim().is_empty() {
                log::debug!("Empty definition, using configured '{configured}'");
                return Ok(configured.trim().to_string());
            }
        }
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        match (registry.len(), registry.keys().next()) {
            (1, Some(only)) => {
                log::debug!("Empty definition, using the only registered function '{only}'");
                Ok(only.clone())
            }
            _ => Err(CatalogError::EmptyDefinition),
        }
    }

    /// Registered names, optionally only those of one kind.
    pub fn names(&self, kind: Option<FunctionKind>) -> BTreeSet<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| kind.is_none_or(|k| d.kind() == k))
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn describe(&self, name: &str) -> Option<FunctionDescription> {
        self.get(name).map(|d| FunctionDescription::from(d.as_ref()))
    }

    /// Every registered function, sorted by name.
    pub fn describe_all(&self) -> BTreeMap<String, FunctionDescription> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, d)| (name.clone(), FunctionDescription::from(d.as_ref())))
            .collect()
    }
}
