//! Device memory policy and low-memory notifications

use crate::error::{Error, Result};
use crate::metrics;
use crate::types::ModelSpec;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;

/// Total memory at or above which a device counts as [`DeviceMemoryTier::High`]
pub const HIGH_MEMORY_THRESHOLD_BYTES: u64 = 12 * GIB;

const WARNING_CHANNEL_CAPACITY: usize = 16;

/// Coarse classification of device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMemoryTier {
    Standard,
    High,
}

impl DeviceMemoryTier {
    pub fn from_total_bytes(total: u64) -> Self {
        if total >= HIGH_MEMORY_THRESHOLD_BYTES {
            Self::High
        } else {
            Self::Standard
        }
    }

    /// Context length in tokens recommended for this tier
    pub fn recommended_context_length(self) -> u32 {
        match self {
            Self::Standard => 2048,
            Self::High => 4096,
        }
    }
}

/// Source of raw memory figures, in bytes
pub trait MemoryProvider: Send + Sync {
    fn total_memory_bytes(&self) -> u64;

    fn available_memory_bytes(&self) -> u64;
}

/// [`MemoryProvider`] backed by `sysinfo`
pub struct SystemMemoryProvider {
    total: u64,
}

impl SystemMemoryProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            total: system.total_memory(),
        }
    }
}

impl Default for SystemMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider for SystemMemoryProvider {
    fn total_memory_bytes(&self) -> u64 {
        self.total
    }

    fn available_memory_bytes(&self) -> u64 {
        let mut system = System::new();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Platform low-memory notification; only the occurrence matters
pub trait LowMemorySignal: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Broadcast-backed [`LowMemorySignal`] that platform glue notifies
#[derive(Debug, Clone)]
pub struct MemoryWarningChannel {
    sender: broadcast::Sender<()>,
}

impl MemoryWarningChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(WARNING_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Raise a warning; returns the number of subscribers reached
    pub fn notify(&self) -> usize {
        self.sender.send(()).unwrap_or(0)
    }
}

impl Default for MemoryWarningChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LowMemorySignal for MemoryWarningChannel {
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

/// Callback run on every low-memory warning
pub type MemoryWarningHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

type HandlerSlot = Arc<Mutex<Option<MemoryWarningHandler>>>;

/// Admission policy over device memory, plus low-memory subscription
pub struct MemoryMonitor {
    provider: Arc<dyn MemoryProvider>,
    signal: Arc<dyn LowMemorySignal>,
    handler: HandlerSlot,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(provider: Arc<dyn MemoryProvider>, signal: Arc<dyn LowMemorySignal>) -> Self {
        Self {
            provider,
            signal,
            handler: Arc::new(Mutex::new(None)),
            subscription: Mutex::new(None),
        }
    }

    /// Monitor using `sysinfo` figures and the given warning channel
    pub fn with_system_memory(channel: MemoryWarningChannel) -> Self {
        Self::new(Arc::new(SystemMemoryProvider::new()), Arc::new(channel))
    }

    pub fn total_memory(&self) -> u64 {
        self.provider.total_memory_bytes()
    }

    pub fn available_memory(&self) -> u64 {
        self.provider.available_memory_bytes()
    }

    pub fn device_memory_tier(&self) -> DeviceMemoryTier {
        DeviceMemoryTier::from_total_bytes(self.total_memory())
    }

    pub fn recommended_context_length(&self) -> u32 {
        self.device_memory_tier().recommended_context_length()
    }

    /// 80% of total memory, rounded down
    pub fn max_allowed_model_memory(&self) -> u64 {
        (u128::from(self.total_memory()) * 4 / 5) as u64
    }

    pub fn is_model_compatible(&self, spec: &ModelSpec) -> bool {
        spec.estimated_memory_bytes <= self.max_allowed_model_memory()
    }

    /// Fail with [`Error::InsufficientMemory`] when `spec` does not fit
    pub fn ensure_compatible(&self, spec: &ModelSpec) -> Result<()> {
        let max_allowed = self.max_allowed_model_memory();
        if spec.estimated_memory_bytes <= max_allowed {
            return Ok(());
        }

        tracing::warn!(
            model_id = %spec.id,
            required = spec.estimated_memory_bytes,
            max_allowed,
            "Model exceeds device memory budget"
        );
        Err(Error::InsufficientMemory {
            required: spec.estimated_memory_bytes,
            available: max_allowed,
        })
    }

    /// Run `handler` on every low-memory warning
    ///
    /// Calling again while monitoring swaps the handler and keeps the existing
    /// subscription. Must be called from within a Tokio runtime.
    pub fn start_monitoring(&self, handler: MemoryWarningHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);

        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("Memory monitoring already active, handler replaced");
            return;
        }

        let warnings = BroadcastStream::new(self.signal.subscribe());
        let handler = self.handler.clone();
        let provider = self.provider.clone();
        *subscription = Some(tokio::spawn(watch_warnings(warnings, handler, provider)));

        tracing::info!("Memory monitoring started");
    }

    /// Drop the subscription and the handler; safe when not monitoring
    pub fn stop_monitoring(&self) {
        if let Some(task) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            tracing::info!("Memory monitoring stopped");
        }
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_monitoring(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        if let Some(task) = self
            .subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn watch_warnings(
    mut warnings: BroadcastStream<()>,
    handler: HandlerSlot,
    provider: Arc<dyn MemoryProvider>,
) {
    while let Some(item) = warnings.next().await {
        // Missed signals still mean memory is tight
        if let Err(BroadcastStreamRecvError::Lagged(missed)) = item {
            tracing::debug!(missed, "Coalesced low memory warnings");
        }

        metrics::record_memory_warning();
        tracing::warn!(
            available_bytes = provider.available_memory_bytes(),
            "Low memory warning"
        );

        let current = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(current) = current {
            current().await;
        }
    }
}

/// Poll `provider` and notify `channel` when available memory drops below
/// `threshold_bytes`
///
/// Edge-triggered: one warning per crossing. Stops when `cancel` fires.
pub fn spawn_pressure_watcher(
    provider: Arc<dyn MemoryProvider>,
    channel: MemoryWarningChannel,
    threshold_bytes: u64,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut below = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Memory pressure watcher stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let query = provider.clone();
                    let available = tokio::task::spawn_blocking(move || query.available_memory_bytes())
                        .await
                        .unwrap_or(u64::MAX);

                    let now_below = available < threshold_bytes;
                    if now_below && !below {
                        tracing::warn!(available, threshold_bytes, "Available memory below threshold");
                        channel.notify();
                    }
                    below = now_below;
                }
            }
        }
    })
}
