//! Pause reasons composed as a logical OR

/// Why a data source was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PauseReason {
    /// The neighbor stage sent Pause
    Peer = 0b0001,
    /// Our own write queue is above its high watermark
    Backlog = 0b0010,
    /// A mux FlowPause frame
    Flow = 0b0100,
    /// The sibling leg of a half-duplex pair stalled
    Leg = 0b1000,
}

/// Set of active pause reasons.
///
/// Pausing twice for the same reason, or resuming a reason that is not
/// active, changes nothing. The source stays stopped while any reason is
/// active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseState(u8);

impl PauseState {
    /// Add a reason; true when this moved the state from running to paused
    pub fn pause(&mut self, reason: PauseReason) -> bool {
        let was_paused = self.is_paused();
        self.0 |= reason as u8;
        !was_paused
    }

    /// Clear a reason; true when this cleared the last active reason
    pub fn resume(&mut self, reason: PauseReason) -> bool {
        if !self.contains(reason) {
            return false;
        }
        self.0 &= !(reason as u8);
        !self.is_paused()
    }

    pub fn is_paused(&self) -> bool {
        self.0 != 0
    }

    pub fn contains(&self, reason: PauseReason) -> bool {
        self.0 & reason as u8 != 0
    }

    /// Number of active reasons
    pub fn active(&self) -> u32 {
        self.0.count_ones()
    }
}
