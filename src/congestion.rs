//! "Brutal": a congestion controller that ignores loss signals entirely and
//! paces its window to a fixed, operator-configured bandwidth.
//!
//! Grounded on `internal/pkg/congestion.NewBrutalSender(bps)` (the source's
//! custom `congestion.Send` implementation passed to `quic-go` via
//! `cc.SetCongestionControl`) and wired into quinn through the
//! `congestion::{Controller, ControllerFactory}` extension point documented
//! in quinn-proto's `TransportConfig::congestion_controller_factory`.

use quinn::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Extra headroom kept above `bandwidth * rtt` so a single RTT of jitter
/// doesn't immediately starve the pipe; mirrors the fixed multiplier the
/// source applies to its bandwidth-delay product.
const CWND_GAIN: u64 = 2;
const MIN_WINDOW: u64 = 4096;

/// Shared, mutable configuration for a `BrutalController`: the target send
/// rate can be updated (e.g. on roster/speed-limit changes) without tearing
/// down the connection.
#[derive(Debug)]
pub struct BrutalConfig {
    bandwidth_bps: AtomicU64,
}

impl BrutalConfig {
    pub fn new(bandwidth_bps: u64) -> Arc<Self> {
        Arc::new(BrutalConfig {
            bandwidth_bps: AtomicU64::new(bandwidth_bps),
        })
    }

    pub fn set_bandwidth_bps(&self, bps: u64) {
        self.bandwidth_bps.store(bps, Ordering::Relaxed);
    }

    pub fn bandwidth_bps(&self) -> u64 {
        self.bandwidth_bps.load(Ordering::Relaxed)
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, _now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(BrutalController::new(self, current_mtu))
    }
}

/// Per-connection controller state. `window()` tracks the bandwidth-delay
/// product of the configured rate against the latest smoothed RTT; loss and
/// persistent-congestion signals are observed but never shrink it.
pub struct BrutalController {
    config: Arc<BrutalConfig>,
    current_mtu: u16,
    window: AtomicU64,
}

impl BrutalController {
    fn new(config: Arc<BrutalConfig>, current_mtu: u16) -> Self {
        let window = MIN_WINDOW.max(current_mtu as u64 * 10);
        BrutalController {
            config,
            current_mtu,
            window: AtomicU64::new(window),
        }
    }

    fn recompute(&self, rtt: &RttEstimator) {
        let bps = self.config.bandwidth_bps();
        if bps == 0 {
            // Unlimited: keep the window generous so pacing never bottlenecks it.
            self.window.store(u64::MAX / 2, Ordering::Relaxed);
            return;
        }
        let rtt_secs = rtt.get().as_secs_f64().max(0.001);
        let bdp = (bps as f64 / 8.0) * rtt_secs * CWND_GAIN as f64;
        self.window.store(bdp.max(MIN_WINDOW as f64) as u64, Ordering::Relaxed);
    }
}

impl Controller for BrutalController {
    fn on_ack(
        &mut self,
        _now: Instant,
        _sent: Instant,
        _bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.recompute(rtt);
    }

    fn on_end_acks(
        &mut self,
        _now: Instant,
        _in_flight: u64,
        _app_limited: Option<Instant>,
        _largest_packet_num_acked: Option<u64>,
    ) {
    }

    /// Brutal's defining property: loss and persistent congestion never
    /// shrink the window. The pacer, not a loss-reactive cwnd, is what keeps
    /// the flow within the configured rate.
    fn on_congestion_event(
        &mut self,
        _now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        _lost_bytes: u64,
    ) {
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.current_mtu = new_mtu;
    }

    fn window(&self) -> u64 {
        self.window.load(Ordering::Relaxed)
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(BrutalController {
            config: self.config.clone(),
            current_mtu: self.current_mtu,
            window: AtomicU64::new(self.window.load(Ordering::Relaxed)),
        })
    }

    fn initial_window(&self) -> u64 {
        MIN_WINDOW.max(self.current_mtu as u64 * 10)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_bandwidth_means_unlimited() {
        let config = BrutalConfig::new(0);
        let ctrl = BrutalController::new(config, 1200);
        let rtt = RttEstimator::new(Duration::from_millis(50));
        ctrl.recompute(&rtt);
        assert!(ctrl.window() > MIN_WINDOW);
    }

    #[test]
    fn window_scales_with_configured_bandwidth() {
        let config = BrutalConfig::new(8_000_000); // 1 MB/s
        let ctrl = BrutalController::new(config.clone(), 1200);
        let rtt = RttEstimator::new(Duration::from_millis(100));
        ctrl.recompute(&rtt);
        let w1 = ctrl.window();

        config.set_bandwidth_bps(16_000_000);
        ctrl.recompute(&rtt);
        let w2 = ctrl.window();

        assert!(w2 > w1);
    }

    #[test]
    fn congestion_events_never_shrink_window() {
        let config = BrutalConfig::new(8_000_000);
        let mut ctrl = BrutalController::new(config, 1200);
        let rtt = RttEstimator::new(Duration::from_millis(100));
        ctrl.recompute(&rtt);
        let before = ctrl.window();
        ctrl.on_congestion_event(Instant::now(), Instant::now(), true, 1_000_000);
        assert_eq!(ctrl.window(), before);
    }
}
