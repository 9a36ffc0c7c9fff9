//! Single-flight slot with latest-wins coalescing.

use parking_lot::Mutex;

#[derive(Debug)]
enum SlotState<T> {
    Idle,
    InFlight { running: T },
    InFlightWithPending { running: T, pending: T },
}

/// At most one run per slot; payloads offered meanwhile collapse into one.
///
/// The caller that gets a payload back from [`SingleFlight::offer`] owns the
/// run and must call [`SingleFlight::finish`] when done, running whatever it
/// returns next.
#[derive(Debug)]
pub(crate) struct SingleFlight<T> {
    state: Mutex<SlotState<T>>,
}

impl<T: Clone + PartialEq> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }

    /// Offer a payload.
    ///
    /// Returns it when the slot was idle and the caller must start running
    /// it. Otherwise the payload becomes the pending one, replacing any older
    /// pending payload. A payload equal to the running one clears the
    /// pending payload instead, since the newest wish is already in progress.
    pub(crate) fn offer(&self, payload: T) -> Option<T> {
        let mut state = self.state.lock();
        let (next, start) = match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Idle => (
                SlotState::InFlight {
                    running: payload.clone(),
                },
                Some(payload),
            ),
            SlotState::InFlight { running } | SlotState::InFlightWithPending { running, .. }
                if running == payload =>
            {
                (SlotState::InFlight { running }, None)
            }
            SlotState::InFlight { running } | SlotState::InFlightWithPending { running, .. } => (
                SlotState::InFlightWithPending {
                    running,
                    pending: payload,
                },
                None,
            ),
        };
        *state = next;
        start
    }

    /// The current run is done. Returns the payload to run next, if any.
    pub(crate) fn finish(&self) -> Option<T> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::InFlightWithPending { pending, .. } => {
                *state = SlotState::InFlight {
                    running: pending.clone(),
                };
                Some(pending)
            }
            SlotState::Idle | SlotState::InFlight { .. } => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Idle)
    }
}
