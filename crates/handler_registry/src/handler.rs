//! Destination handler record
//!
//! One record per destination: a name plus an optional slot per capability.

use std::fmt;
use std::sync::Arc;

use contracts::{
    Batcher, Capability, DestinationName, FileUploader, JobStatusFetcher, NetworkHandler,
    Processor, RouterTransformer, StatusPoller, UserDeleter,
};

/// Polymorphic destination handler
///
/// Cloning is cheap: every capability is behind an `Arc`.
#[derive(Clone, Default)]
pub struct DestinationHandler {
    name: DestinationName,
    processor: Option<Arc<dyn Processor>>,
    router: Option<Arc<dyn RouterTransformer>>,
    batcher: Option<Arc<dyn Batcher>>,
    network: Option<Arc<dyn NetworkHandler>>,
    file_uploader: Option<Arc<dyn FileUploader>>,
    poller: Option<Arc<dyn StatusPoller>>,
    job_status: Option<Arc<dyn JobStatusFetcher>>,
    user_deleter: Option<Arc<dyn UserDeleter>>,
}

impl DestinationHandler {
    pub fn builder(name: impl Into<DestinationName>) -> DestinationHandlerBuilder {
        DestinationHandlerBuilder {
            handler: Self {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &DestinationName {
        &self.name
    }

    /// Whether the capability is implemented
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Process => self.processor.is_some(),
            Capability::RouterTransform => self.router.is_some(),
            Capability::Batch => self.batcher.is_some(),
            Capability::Proxy => self.network.is_some(),
            Capability::FileUpload => self.file_uploader.is_some(),
            Capability::Poll => self.poller.is_some(),
            Capability::FetchJobStatus => self.job_status.is_some(),
            Capability::DeleteUsers => self.user_deleter.is_some(),
        }
    }

    /// Implemented capabilities, in declaration order
    pub fn capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.has(*c))
            .collect()
    }

    pub fn processor(&self) -> Option<&Arc<dyn Processor>> {
        self.processor.as_ref()
    }

    pub fn router(&self) -> Option<&Arc<dyn RouterTransformer>> {
        self.router.as_ref()
    }

    pub fn batcher(&self) -> Option<&Arc<dyn Batcher>> {
        self.batcher.as_ref()
    }

    pub fn network(&self) -> Option<&Arc<dyn NetworkHandler>> {
        self.network.as_ref()
    }

    pub fn file_uploader(&self) -> Option<&Arc<dyn FileUploader>> {
        self.file_uploader.as_ref()
    }

    pub fn poller(&self) -> Option<&Arc<dyn StatusPoller>> {
        self.poller.as_ref()
    }

    pub fn job_status(&self) -> Option<&Arc<dyn JobStatusFetcher>> {
        self.job_status.as_ref()
    }

    pub fn user_deleter(&self) -> Option<&Arc<dyn UserDeleter>> {
        self.user_deleter.as_ref()
    }
}

impl fmt::Debug for DestinationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationHandler")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Builder for [`DestinationHandler`]
pub struct DestinationHandlerBuilder {
    handler: DestinationHandler,
}

impl DestinationHandlerBuilder {
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.handler.processor = Some(processor);
        self
    }

    pub fn router(mut self, router: Arc<dyn RouterTransformer>) -> Self {
        self.handler.router = Some(router);
        self
    }

    pub fn batcher(mut self, batcher: Arc<dyn Batcher>) -> Self {
        self.handler.batcher = Some(batcher);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkHandler>) -> Self {
        self.handler.network = Some(network);
        self
    }

    pub fn file_uploader(mut self, uploader: Arc<dyn FileUploader>) -> Self {
        self.handler.file_uploader = Some(uploader);
        self
    }

    pub fn poller(mut self, poller: Arc<dyn StatusPoller>) -> Self {
        self.handler.poller = Some(poller);
        self
    }

    pub fn job_status(mut self, fetcher: Arc<dyn JobStatusFetcher>) -> Self {
        self.handler.job_status = Some(fetcher);
        self
    }

    pub fn user_deleter(mut self, deleter: Arc<dyn UserDeleter>) -> Self {
        self.handler.user_deleter = Some(deleter);
        self
    }

    pub fn build(self) -> DestinationHandler {
        self.handler
    }
}
