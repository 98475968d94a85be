//! Heartbeat frames and liveness tracking.
//!
//! The writer task sends a heartbeat every interval; any inbound frame
//! counts as activity. A session whose peer stays silent for longer than the
//! heartbeat timeout is declared lost.

use bytes::Bytes;
use courier_wire::{CodecError, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Build a heartbeat frame, or the echo of a peer heartbeat
pub fn build_heartbeat(token: u64, reply: bool, max_frame: usize) -> Result<Bytes, CodecError> {
    Frame::Heartbeat { token, reply }.encode(max_frame)
}

/// Generate a heartbeat token based on monotonic time
pub fn now_token() -> u64 {
    static START: once_cell::sync::Lazy<std::time::Instant> =
        once_cell::sync::Lazy::new(std::time::Instant::now);
    (START.elapsed().as_nanos() & 0xFFFF_FFFF_FFFF_FFFF) as u64
}

/// Last-activity clock shared by the reader and writer tasks
#[derive(Debug)]
pub struct LivenessMonitor {
    origin: Instant,
    last_activity_ms: AtomicU64,
    timeout: Duration,
}

impl LivenessMonitor {
    /// Create a monitor that considers the peer alive right now
    pub fn new(timeout: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            timeout,
        }
    }

    /// Record inbound activity
    pub fn record_activity(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Whether the peer has been silent for longer than the timeout
    pub fn is_expired(&self) -> bool {
        self.idle() > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use courier_wire::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};

    #[test]
    fn test_heartbeat_frames() {
        let bytes = build_heartbeat(42, true, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut buf = BytesMut::from(bytes.as_ref());
        let raw = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            Frame::decode(raw).unwrap(),
            Frame::Heartbeat {
                token: 42,
                reply: true
            }
        );
    }

    #[test]
    fn test_token_generation() {
        let t1 = now_token();
        std::thread::sleep(Duration::from_millis(1));
        let t2 = now_token();
        assert!(t2 > t1, "tokens should be monotonically increasing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expiry() {
        let monitor = LivenessMonitor::new(Duration::from_secs(3));
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        monitor.record_activity();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(monitor.is_expired());
        assert!(monitor.idle() >= Duration::from_millis(3500));
    }
}
