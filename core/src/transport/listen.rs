//! Listen duty cycling
//!
//! Radios are expensive to leave on. Callers ask an interface to listen for
//! a while and the controller merges overlapping requests: a timed request
//! may extend the current window but never shortens it, `OnForever` wins
//! over any timed request, and `OffImmediately` overrides everything.

use super::abstraction::CommsInterface;
use crate::CommsError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A listen request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenDuration {
    OffImmediately,
    OnForever,
    For(Duration),
}

/// Current listening state of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenMode {
    Off,
    /// On until the timer expires
    Timed,
    Forever,
}

struct ListenState {
    mode: ListenMode,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced or cancelled
    generation: u64,
}

impl ListenState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.deadline = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Owns the listen timer of one interface.
///
/// Timed requests need a tokio runtime to run the expiry timer.
pub struct ListenController {
    interface: Arc<dyn CommsInterface>,
    state: Arc<Mutex<ListenState>>,
}

impl ListenController {
    pub fn new(interface: Arc<dyn CommsInterface>) -> Self {
        Self {
            interface,
            state: Arc::new(Mutex::new(ListenState {
                mode: ListenMode::Off,
                deadline: None,
                timer: None,
                generation: 0,
            })),
        }
    }

    pub fn mode(&self) -> ListenMode {
        self.state.lock().mode
    }

    /// Time left on the current window, if a timer is running
    pub fn remaining(&self) -> Option<Duration> {
        self.state
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn listen(&self, duration: ListenDuration) -> Result<(), CommsError> {
        let kind = self.interface.kind();
        let mut state = self.state.lock();
        match duration {
            ListenDuration::OffImmediately => {
                state.cancel_timer();
                state.mode = ListenMode::Off;
                debug!("{} listen off", kind);
                self.interface.enable(false)
            }
            ListenDuration::OnForever => {
                state.cancel_timer();
                state.mode = ListenMode::Forever;
                debug!("{} listen forever", kind);
                self.interface.enable(true)
            }
            ListenDuration::For(window) => {
                if state.mode == ListenMode::Forever {
                    debug!("{} already listening forever, {:?} request ignored", kind, window);
                    return Ok(());
                }
                let now = Instant::now();
                if let Some(deadline) = state.deadline {
                    if deadline.saturating_duration_since(now) > window {
                        return Ok(());
                    }
                }
                let runtime = Handle::try_current().map_err(|_| {
                    CommsError::InvalidState("listen timers need a tokio runtime".to_string())
                })?;

                state.cancel_timer();
                let deadline = now + window;
                let generation = state.generation;
                state.deadline = Some(deadline);
                state.mode = ListenMode::Timed;
                state.timer = Some(runtime.spawn(expire(
                    self.interface.clone(),
                    self.state.clone(),
                    deadline,
                    generation,
                )));
                debug!("{} listening for {:?}", kind, window);
                self.interface.enable(true)
            }
        }
    }
}

impl Drop for ListenController {
    fn drop(&mut self) {
        self.state.lock().cancel_timer();
    }
}

async fn expire(
    interface: Arc<dyn CommsInterface>,
    state: Arc<Mutex<ListenState>>,
    deadline: Instant,
    generation: u64,
) {
    tokio::time::sleep_until(deadline).await;
    let mut state = state.lock();
    if state.generation != generation {
        return;
    }
    state.timer = None;
    state.deadline = None;
    state.mode = ListenMode::Off;
    debug!("{} listen window expired", interface.kind());
    if let Err(e) = interface.enable(false) {
        warn!("Failed to disable {} after listen window: {}", interface.kind(), e);
    }
}
