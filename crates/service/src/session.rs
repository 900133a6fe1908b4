use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::{ident::Id, proto::OutboundFrame};

/// Fixed-window counter gating all inbound frames of one session.
#[derive(Debug)]
pub struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    pub const WINDOW: Duration = Duration::from_millis(2000);
    pub const MAX_FRAMES: u32 = 20;

    pub fn new(now: Instant) -> Self {
        Self { window_start: now, count: 0 }
    }

    /// Count one frame against the window.
    ///
    /// Returns `false` once the cap is exceeded; the frame is consumed either
    /// way and an over-cap frame must not be dispatched.
    pub fn admit(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) > Self::WINDOW {
            self.window_start = now;
            self.count = 0;
        }

        self.count += 1;
        self.count <= Self::MAX_FRAMES
    }
}

/// The hub's record of one connected client.
///
/// Owned by the session table; the only handle the transport side keeps is
/// the outbound receiver paired with `sender`.
pub struct Session {
    pub id: Id,
    /// Unset until the client successfully claims a display name.
    pub name: Option<String>,
    /// Set iff the session is in a call, ringing or connected.
    pub room_id: Option<Id>,
    pub last_frame_at: Instant,
    pub rate: RateWindow,
    sender: UnboundedSender<OutboundFrame>,
}

impl Session {
    pub fn new(id: Id, sender: UnboundedSender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: None,
            room_id: None,
            last_frame_at: now,
            rate: RateWindow::new(now),
            sender,
        }
    }

    /// Whether the transport side is still draining this session's queue.
    pub fn is_ready(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue one frame for delivery.
    ///
    /// A closed channel means the peer is mid-disconnect; the frame is
    /// dropped and the disconnect handler will reap the session.
    pub fn send(&self, frame: OutboundFrame) {
        let _ = self.sender.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_caps_and_resets() {
        let start = Instant::now();
        let mut rate = RateWindow::new(start);

        for _ in 0..RateWindow::MAX_FRAMES {
            assert!(rate.admit(start));
        }
        assert!(!rate.admit(start));
        assert!(!rate.admit(start));

        // A frame past the window opens a fresh one.
        let later = start + RateWindow::WINDOW + Duration::from_millis(1);
        assert!(rate.admit(later));
    }
}
