use crate::Cancelled;

/// Observable paused/running latch.
///
/// Transfer loops call [`PauseGate::wait_while_paused`] at every segment
/// boundary: it returns immediately while running and parks the caller (no
/// spinning) while paused. The pause state is a single watch slot; `resume`
/// publishes the change and wakes every parked waiter at once.
pub struct PauseGate {
    state: tokio::sync::watch::Sender<bool>,
}

impl PauseGate {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = tokio::sync::watch::channel(false);
        Self { state }
    }

    pub fn pause(&self) {
        self.state.send_replace(true);
    }

    pub fn resume(&self) {
        self.state.send_replace(false);
    }

    /// Flip the state, returning the new value (`true` = paused).
    pub fn toggle(&self) -> bool {
        let mut paused = false;
        self.state.send_modify(|state| {
            *state = !*state;
            paused = *state;
        });
        paused
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow()
    }

    /// Suspend until the gate is open or `cancel` fires.
    ///
    /// A pause published before this call is guaranteed to block the caller;
    /// a pause published after it may let the current segment complete first.
    pub async fn wait_while_paused(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), Cancelled> {
        let mut watcher = self.state.subscribe();
        loop {
            if !*watcher.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                changed = watcher.changed() => {
                    if changed.is_err() {
                        // gate dropped while paused; treat as resumed
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PauseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseGate")
            .field("paused", &self.is_paused())
            .finish()
    }
}
