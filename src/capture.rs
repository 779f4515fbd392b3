//! Capture relay
//!
//! `CaptureScheduler` produces a simulated capture on every tick and hands it
//! to `CaptureClient` when a live manager is known. Delivery is best-effort:
//! nothing is queued or retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::overlay::Overlay;
use crate::registry::ManagerRegistry;
use crate::wire::{CaptureMessage, CaptureOutcome, SubProtocol, MANAGER_TOKEN};

#[derive(Clone)]
pub struct CaptureClient {
    overlay: Arc<dyn Overlay>,
}

impl CaptureClient {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self { overlay }
    }

    /// Send `message` to `peer` and interpret its acknowledgement.
    pub async fn send(&self, peer: PeerId, message: &CaptureMessage) -> Result<CaptureOutcome> {
        let payload = message.to_payload()?;
        let ack = self
            .overlay
            .request(peer, SubProtocol::Capture, payload)
            .await?;
        Ok(CaptureOutcome::from_ack(&ack))
    }
}

/// What happened to one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acknowledged(CaptureOutcome),
    /// No live manager; the capture was dropped before any dial.
    Unavailable,
    /// The manager could not be reached after it was resolved.
    Lost,
}

/// Clears the single-flight flag when the relay task finishes, panics or is aborted.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct CaptureScheduler {
    registry: Arc<ManagerRegistry>,
    client: CaptureClient,
    period: Duration,
    single_flight: bool,
    in_flight: Arc<AtomicBool>,
}

impl CaptureScheduler {
    /// A zero `period` is raised to one millisecond.
    pub fn new(registry: Arc<ManagerRegistry>, client: CaptureClient, period: Duration) -> Self {
        Self {
            registry,
            client,
            period: period.max(Duration::from_millis(1)),
            single_flight: false,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Skip ticks while a previous relay is still running.
    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    /// Resolve the manager and relay `message` to it.
    pub async fn relay(&self, message: CaptureMessage) -> Delivery {
        let Some(manager) = self.registry.get_manager().await else {
            warn!("{} unavailable. Capture will be lost", MANAGER_TOKEN);
            return Delivery::Unavailable;
        };

        match self.client.send(manager, &message).await {
            Ok(outcome) => {
                info!("Capture {} by manager", outcome);
                Delivery::Acknowledged(outcome)
            }
            Err(e) => {
                warn!("Capture {} lost, {} {}: {}", message.value, MANAGER_TOKEN, manager, e);
                Delivery::Lost
            }
        }
    }

    fn tick(&self) {
        let guard = if self.single_flight {
            if self.in_flight.swap(true, Ordering::AcqRel) {
                debug!("Previous capture still in flight, skipping tick");
                return;
            }
            Some(InFlight(self.in_flight.clone()))
        } else {
            None
        };

        let message = CaptureMessage::simulate();
        debug!("Simulate capture {:?}", message);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            scheduler.relay(message).await;
        });
    }

    /// Start ticking every period, first tick one period from now. Abort the handle to stop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Capture scheduler started, interval={:?}", self.period);

            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Manager that always answers pings and holds each capture for `delay`.
    struct SlowManager {
        delay: Duration,
        captures: AtomicUsize,
    }

    #[async_trait]
    impl Overlay for SlowManager {
        async fn request(
            &self,
            _peer: PeerId,
            protocol: SubProtocol,
            _payload: Vec<u8>,
        ) -> Result<Vec<u8>> {
            if protocol != SubProtocol::Capture {
                return Err(RelayError::Unsupported(protocol.to_string()));
            }
            self.captures.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(b"true".to_vec())
        }

        async fn ping(&self, _peer: PeerId) -> Result<Duration> {
            Ok(Duration::from_millis(1))
        }
    }

    async fn run_scheduler(single_flight: bool) -> usize {
        let overlay = Arc::new(SlowManager {
            delay: Duration::from_secs(12),
            captures: AtomicUsize::new(0),
        });
        let registry = Arc::new(ManagerRegistry::new(overlay.clone()));
        registry.set_manager(PeerId::random()).await;

        let scheduler = CaptureScheduler::new(
            registry,
            CaptureClient::new(overlay.clone()),
            Duration::from_secs(5),
        )
        .with_single_flight(single_flight);
        let handle = scheduler.spawn();

        // Ticks fire at 5s, 10s and 15s; the first send is held until 17s
        tokio::time::sleep(Duration::from_secs(16)).await;
        handle.abort();
        overlay.captures.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_overlap_by_default() {
        assert_eq!(run_scheduler(false).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_skips_overlapping_ticks() {
        assert_eq!(run_scheduler(true).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_before_first_period() {
        let overlay = Arc::new(SlowManager {
            delay: Duration::ZERO,
            captures: AtomicUsize::new(0),
        });
        let registry = Arc::new(ManagerRegistry::new(overlay.clone()));
        registry.set_manager(PeerId::random()).await;

        let handle = CaptureScheduler::new(
            registry,
            CaptureClient::new(overlay.clone()),
            Duration::from_secs(5),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(overlay.captures.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(overlay.captures.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    /// Manager whose first capture request panics mid-send.
    struct PanickingManager {
        captures: AtomicUsize,
    }

    #[async_trait]
    impl Overlay for PanickingManager {
        async fn request(
            &self,
            _peer: PeerId,
            _protocol: SubProtocol,
            _payload: Vec<u8>,
        ) -> Result<Vec<u8>> {
            if self.captures.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("relay task died");
            }
            Ok(b"true".to_vec())
        }

        async fn ping(&self, _peer: PeerId) -> Result<Duration> {
            Ok(Duration::from_millis(1))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_recovers_after_relay_panic() {
        let overlay = Arc::new(PanickingManager {
            captures: AtomicUsize::new(0),
        });
        let registry = Arc::new(ManagerRegistry::new(overlay.clone()));
        registry.set_manager(PeerId::random()).await;

        let handle = CaptureScheduler::new(
            registry,
            CaptureClient::new(overlay.clone()),
            Duration::from_secs(5),
        )
        .with_single_flight(true)
        .spawn();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(overlay.captures.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_clamped() {
        let overlay = Arc::new(SlowManager {
            delay: Duration::ZERO,
            captures: AtomicUsize::new(0),
        });
        let registry = Arc::new(ManagerRegistry::new(overlay.clone()));
        registry.set_manager(PeerId::random()).await;

        let scheduler =
            CaptureScheduler::new(registry, CaptureClient::new(overlay.clone()), Duration::ZERO);
        assert_eq!(scheduler.period, Duration::from_millis(1));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(overlay.captures.load(Ordering::SeqCst) >= 1);
        handle.abort();
    }
}
