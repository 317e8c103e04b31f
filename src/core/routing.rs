use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::catalog::FunctionCatalog;
use crate::core::error::{CatalogError, Result};
use crate::core::invocation::LookupOptions;
use crate::core::payload::Data;

pub const CONTENT_TYPE: &str = "content-type";
pub const ACCEPT: &str = "accept";

/// A payload plus its headers, as adapters hand them over.
#[derive(Debug)]
pub struct Message {
    pub payload: Data,
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Data>) -> Self {
        Self {
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Dispatches messages to the definition named in their routing header.
///
/// Without the header the configured catalog definition is used; with neither the
/// message is rejected.
#[derive(Clone)]
pub struct RoutingFunction {
    catalog: Arc<FunctionCatalog>,
}

impl RoutingFunction {
    pub fn new(catalog: Arc<FunctionCatalog>) -> Self {
        Self { catalog }
    }

    /// The definition `message` would be routed to.
    pub fn resolve_definition(&self, message: &Message) -> Result<String> {
        let header = &self.catalog.config().routing_header;
        if let Some(definition) = message.header(header).filter(|d| !d.trim().is_empty()) {
            return Ok(definition.to_string());
        }
        if let Some(definition) = self
            .catalog
            .config()
            .definition
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        {
            return Ok(definition.to_string());
        }
        Err(CatalogError::Routing(format!(
            "no '{header}' header and no default definition configured"
        )))
    }

    pub async fn route(&self, message: Message) -> Result<Option<Message>> {
        self.route_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// Looks up the routed definition and invokes it with the message payload.
    ///
    /// `content-type` selects the input converter and `accept` the output one; the reply
    /// carries the media type actually produced.
    pub async fn route_with_cancel(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>> {
        let definition = self.resolve_definition(&message)?;
        let mut options = LookupOptions::new();
        if let Some(ct) = message.header(CONTENT_TYPE) {
            options = options.input_content_type(ct);
        }
        match message.header(ACCEPT).filter(|a| a.trim() != "*/*") {
            Some(accept) => options = options.output_content_type(accept),
            None => {
                if let Some(ct) = message.header(CONTENT_TYPE) {
                    options = options.output_content_type(ct);
                }
            }
        }
        log::debug!("Routing message to '{definition}'");

        let wrapper = self.catalog.lookup_with(&definition, options)?;
        let output = wrapper
            .invoke_with_cancel(Some(message.payload), cancel)
            .await?;
        Ok(output.map(|payload| {
            let reply = Message::new(payload);
            match wrapper.output_content_type() {
                Some(ct) => reply.with_header(CONTENT_TYPE, ct),
                None => reply,
            }
        }))
    }
}
