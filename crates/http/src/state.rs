use std::sync::Arc;

use extractor::EntityExtractor;
use labels::LabelReflector;
use provider::ProviderClient;
use queue::{AiProcessingQueue, NotificationQueue};
use resolver::ProjectResolver;
use scheduler::Scheduler;
use store::Store;
use watch::WatchCoordinator;

/// Everything a handler needs, grouped the way `main` wires it up.
/// Cloning is cheap — every field is an `Arc`.
pub struct AppState<P: ProviderClient, E: EntityExtractor> {
    pub store: Arc<Store>,
    pub provider: Arc<P>,
    pub watch: Arc<WatchCoordinator<P>>,
    pub notifications: Arc<NotificationQueue>,
    pub ai_queue: Arc<AiProcessingQueue>,
    pub resolver: Arc<ProjectResolver>,
    pub labels: Arc<LabelReflector<P>>,
    pub corrections: Arc<corrections::CorrectionStore>,
    pub scheduler: Arc<Scheduler<P, E>>,
    pub auth_token: Arc<str>,
    pub scan_page_size: u32,
}

impl<P: ProviderClient, E: EntityExtractor> Clone for AppState<P, E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            provider: self.provider.clone(),
            watch: self.watch.clone(),
            notifications: self.notifications.clone(),
            ai_queue: self.ai_queue.clone(),
            resolver: self.resolver.clone(),
            labels: self.labels.clone(),
            corrections: self.corrections.clone(),
            scheduler: self.scheduler.clone(),
            auth_token: self.auth_token.clone(),
            scan_page_size: self.scan_page_size,
        }
    }
}

#[allow(clippy::too_many_arguments)]
impl<P: ProviderClient, E: EntityExtractor> AppState<P, E> {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<P>,
        watch: Arc<WatchCoordinator<P>>,
        notifications: Arc<NotificationQueue>,
        ai_queue: Arc<AiProcessingQueue>,
        resolver: Arc<ProjectResolver>,
        labels: Arc<LabelReflector<P>>,
        corrections: Arc<corrections::CorrectionStore>,
        scheduler: Arc<Scheduler<P, E>>,
        auth_token: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store,
            provider,
            watch,
            notifications,
            ai_queue,
            resolver,
            labels,
            corrections,
            scheduler,
            auth_token: auth_token.into(),
            scan_page_size: 50,
        }
    }
}
