//! Backlog throttle for producer/consumer backpressure.
//!
//! Watches the backlog of a sequential consumer (bytes buffered for an
//! encoder, items waiting in a queue) and pauses the producing runner when it
//! grows past the high watermark. The runner is resumed once the backlog
//! drains below the low watermark.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::PauseHandle;

/// Configuration for the backlog throttle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// When false, the producer is never paused.
    pub enabled: bool,
    /// Backlog above which the producer is paused.
    pub high_watermark: usize,
    /// Backlog below which a paused producer is resumed.
    pub low_watermark: usize,
    /// Interval between backlog checks when monitoring.
    pub check_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_watermark: 64 * 1024 * 1024,
            low_watermark: 16 * 1024 * 1024,
            check_interval: Duration::from_millis(100),
        }
    }
}

/// Transitions emitted by the throttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// The backlog crossed the high watermark and the producer was paused.
    Paused { backlog: usize },
    /// The backlog fell below the low watermark and the producer resumed.
    Resumed { backlog: usize },
}

/// Something the throttle can pause and resume.
pub trait FlowControl: Send + Sync {
    fn pause(&self);

    fn resume(&self);
}

impl FlowControl for PauseHandle {
    fn pause(&self) {
        PauseHandle::pause(self);
    }

    fn resume(&self) {
        PauseHandle::resume(self);
    }
}

/// Pauses a producer while its consumer's backlog is too large.
pub struct BacklogThrottle {
    config: ThrottleConfig,
    throttled: AtomicBool,
    event_tx: broadcast::Sender<ThrottleEvent>,
}

impl BacklogThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            throttled: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThrottleEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Compare `backlog` against the watermarks and pause or resume `flow`.
    /// Returns the transition, if one happened.
    pub fn observe<C: FlowControl + ?Sized>(
        &self,
        backlog: usize,
        flow: &C,
    ) -> Option<ThrottleEvent> {
        if !self.config.enabled {
            return None;
        }

        let throttled = self.is_throttled();
        let event = if !throttled && backlog > self.config.high_watermark {
            flow.pause();
            self.throttled.store(true, Ordering::SeqCst);
            info!(
                backlog,
                high_watermark = self.config.high_watermark,
                "Consumer backlog too large, pausing producer"
            );
            ThrottleEvent::Paused { backlog }
        } else if throttled && backlog < self.config.low_watermark {
            flow.resume();
            self.throttled.store(false, Ordering::SeqCst);
            info!(backlog, "Consumer caught up, resuming producer");
            ThrottleEvent::Resumed { backlog }
        } else {
            return None;
        };

        let _ = self.event_tx.send(event.clone());
        Some(event)
    }

    /// Check `backlog()` every `check_interval` until `cancel` fires. A
    /// paused producer is resumed on shutdown.
    pub fn start_monitoring<B>(
        self: Arc<Self>,
        backlog: B,
        flow: Arc<dyn FlowControl>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>>
    where
        B: Fn() -> usize + Send + Sync + 'static,
    {
        if !self.config.enabled {
            debug!("Backlog throttle disabled, not monitoring");
            return None;
        }

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if self.throttled.swap(false, Ordering::SeqCst) {
                            flow.resume();
                            debug!("Resumed producer on throttle shutdown");
                        }
                        break;
                    }
                    _ = tokio::time::sleep(self.config.check_interval) => {
                        self.observe(backlog(), flow.as_ref());
                    }
                }
            }
        }))
    }
}

impl Default for BacklogThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}
