//! HandlerRegistry core implementation
//!
//! Static per deployment: handlers are registered at startup and resolved by
//! destination name through an alias map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use contracts::{
    Batcher, Capability, DestinationName, FileUploader, JobStatusFetcher, NetworkHandler,
    PipelineError, Processor, RegistryConfig, RouterTransformer, StatusPoller, UserDeleter,
};
use tracing::{debug, info};

use crate::handler::DestinationHandler;

/// Destination handler registry
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<DestinationName, DestinationHandler>,
    aliases: HashMap<DestinationName, DestinationName>,
    config_driven: HashSet<DestinationName>,
    fallback_network: Option<Arc<dyn NetworkHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Apply the alias map to an external name
    pub fn canonical_name(&self, name: &str) -> DestinationName {
        let name = DestinationName::new(name);
        match self.aliases.get(&name) {
            Some(target) => target.clone(),
            None => name,
        }
    }

    /// Resolve a destination name to its handler
    ///
    /// # Errors
    /// `NotFound` when nothing is registered under the name or its alias.
    pub fn resolve(&self, name: &str) -> Result<&DestinationHandler, PipelineError> {
        let canonical = self.canonical_name(name);
        self.handlers.get(&canonical).ok_or_else(|| {
            debug!(destination = %name, canonical = %canonical, "no handler registered");
            PipelineError::not_found(name)
        })
    }

    /// Whether the handler for `name` implements `capability`
    ///
    /// Unknown names report `false`.
    pub fn supports(&self, name: &str, capability: Capability) -> bool {
        self.resolve(name)
            .map(|handler| handler.has(capability))
            .unwrap_or(false)
    }

    /// Resolve and require a capability
    ///
    /// # Errors
    /// `NotFound` for unknown names, `UnsupportedOperation` when the handler
    /// lacks the capability.
    pub fn require(
        &self,
        name: &str,
        capability: Capability,
    ) -> Result<&DestinationHandler, PipelineError> {
        let handler = self.resolve(name)?;
        if handler.has(capability) {
            Ok(handler)
        } else {
            Err(PipelineError::unsupported(name, capability))
        }
    }

    pub fn processor(&self, name: &str) -> Result<Arc<dyn Processor>, PipelineError> {
        self.capability(name, Capability::Process, DestinationHandler::processor)
    }

    pub fn router(&self, name: &str) -> Result<Arc<dyn RouterTransformer>, PipelineError> {
        self.capability(name, Capability::RouterTransform, DestinationHandler::router)
    }

    pub fn batcher(&self, name: &str) -> Result<Arc<dyn Batcher>, PipelineError> {
        self.capability(name, Capability::Batch, DestinationHandler::batcher)
    }

    pub fn file_uploader(&self, name: &str) -> Result<Arc<dyn FileUploader>, PipelineError> {
        self.capability(name, Capability::FileUpload, DestinationHandler::file_uploader)
    }

    pub fn poller(&self, name: &str) -> Result<Arc<dyn StatusPoller>, PipelineError> {
        self.capability(name, Capability::Poll, DestinationHandler::poller)
    }

    pub fn job_status(&self, name: &str) -> Result<Arc<dyn JobStatusFetcher>, PipelineError> {
        self.capability(name, Capability::FetchJobStatus, DestinationHandler::job_status)
    }

    pub fn user_deleter(&self, name: &str) -> Result<Arc<dyn UserDeleter>, PipelineError> {
        self.capability(name, Capability::DeleteUsers, DestinationHandler::user_deleter)
    }

    /// Network handler for the proxy path
    ///
    /// A destination-specific handler wins; otherwise the registry fallback
    /// is used, including for names with no registered handler at all.
    pub fn network(&self, name: &str) -> Result<Arc<dyn NetworkHandler>, PipelineError> {
        let own = self
            .resolve(name)
            .ok()
            .and_then(|handler| handler.network().cloned());
        if let Some(network) = own.or_else(|| self.fallback_network.clone()) {
            return Ok(network);
        }
        match self.resolve(name) {
            Ok(_) => Err(PipelineError::unsupported(name, Capability::Proxy)),
            Err(e) => Err(e),
        }
    }

    /// Whether the destination's output is compared against the alternate
    /// executor
    pub fn is_config_driven(&self, name: &str) -> bool {
        self.config_driven.contains(&self.canonical_name(name))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn capability<T: ?Sized>(
        &self,
        name: &str,
        capability: Capability,
        pick: impl Fn(&DestinationHandler) -> Option<&Arc<T>>,
    ) -> Result<Arc<T>, PipelineError> {
        let handler = self.resolve(name)?;
        pick(handler)
            .cloned()
            .ok_or_else(|| PipelineError::unsupported(name, capability))
    }
}

/// Builder for [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registry: HandlerRegistry,
}

impl HandlerRegistryBuilder {
    /// Register a handler under its own name, replacing any previous one
    pub fn register(mut self, handler: DestinationHandler) -> Self {
        let name = handler.name().clone();
        if self.registry.handlers.insert(name.clone(), handler).is_some() {
            debug!(destination = %name, "handler replaced");
        }
        self
    }

    /// Route `alias` to the handler registered as `target`
    pub fn alias(mut self, alias: &str, target: &str) -> Self {
        self.registry
            .aliases
            .insert(DestinationName::new(alias), DestinationName::new(target));
        self
    }

    /// Mark a destination as config-driven
    pub fn config_driven(mut self, name: &str) -> Self {
        self.registry.config_driven.insert(DestinationName::new(name));
        self
    }

    /// Apply aliases and config-driven flags from configuration
    pub fn with_config(self, config: &RegistryConfig) -> Self {
        let builder = config
            .aliases
            .iter()
            .fold(self, |builder, (alias, target)| builder.alias(alias, target));
        config
            .cdk_destinations
            .iter()
            .fold(builder, |builder, name| builder.config_driven(name))
    }

    /// Network handler used when a destination has none of its own
    pub fn fallback_network(mut self, network: Arc<dyn NetworkHandler>) -> Self {
        self.registry.fallback_network = Some(network);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        info!(
            handlers = self.registry.handlers.len(),
            aliases = self.registry.aliases.len(),
            config_driven = self.registry.config_driven.len(),
            "handler registry built"
        );
        self.registry
    }
}
