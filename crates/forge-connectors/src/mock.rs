//! Recording connector for router and factory tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{
    ChannelInfo, Connector, InboundMessage, MediaKind, OutboundMessage, PlatformError,
};

/// Mock [`Connector`] that records sends and lets tests inject inbound
/// messages through the sender the router installed.
pub struct MockConnector {
    id: String,
    started: AtomicBool,
    /// Sends fail with `Unavailable` while this counter is positive.
    fail_sends: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
    media: Mutex<Vec<(String, std::path::PathBuf, MediaKind)>>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    channels: Mutex<Vec<ChannelInfo>>,
}

impl MockConnector {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            started: AtomicBool::new(false),
            fail_sends: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            media: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(id: &str) -> Arc<dyn Connector> {
        Arc::new(Self::new(id))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Fail the next `count` sends.
    pub fn fail_next_sends(&self, count: usize) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_media(&self) -> Vec<(String, std::path::PathBuf, MediaKind)> {
        lock(&self.media).clone()
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        *lock(&self.channels) = channels;
    }

    /// Push an inbound message as if it arrived from the platform.
    /// Panics if the connector was never started.
    pub async fn inject(&self, message: InboundMessage) {
        let sender = lock(&self.inbound)
            .clone()
            .expect("mock connector not started");
        sender.send(message).await.expect("router dispatch closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), PlatformError> {
        *lock(&self.inbound) = Some(inbound);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        self.started.store(false, Ordering::SeqCst);
        *lock(&self.inbound) = None;
        Ok(())
    }

    async fn send_text(&self, message: &OutboundMessage) -> Result<(), PlatformError> {
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(PlatformError::Unavailable("scripted failure".to_string()));
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }

    async fn send_media(
        &self,
        channel_id: &str,
        path: &Path,
        kind: MediaKind,
    ) -> Result<(), PlatformError> {
        lock(&self.media).push((channel_id.to_string(), path.to_path_buf(), kind));
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError> {
        Ok(lock(&self.channels).clone())
    }

    async fn validate_channel(&self, channel_id: &str) -> Result<bool, PlatformError> {
        let channels = lock(&self.channels);
        Ok(channels.is_empty() || channels.iter().any(|c| c.id == channel_id))
    }
}
