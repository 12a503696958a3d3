//! Shutdown gate
//!
//! A per-engine busy gate: snapshot work enters while the engine runs,
//! `stop` flips the gate and blocks until outstanding work drains. Work
//! arriving during shutdown fails immediately with `ShuttingDown`.

use std::sync::{Arc, Condvar, Mutex};

use crate::errors::{SnapshotError, SnapshotResult};

#[derive(Debug, Default)]
struct GateState {
    stopping: bool,
    active: usize,
}

/// Busy gate over the engine's snapshot work.
#[derive(Debug, Default)]
pub struct ShutdownGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl ShutdownGate {
    /// Fresh, open gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail when the engine is stopping.
    pub fn check(&self) -> SnapshotResult<()> {
        let state = self.state.lock().expect("gate lock poisoned");
        if state.stopping {
            return Err(SnapshotError::ShuttingDown);
        }
        Ok(())
    }

    /// Enter the gate for the lifetime of the returned guard.
    pub fn enter(self: &Arc<Self>) -> SnapshotResult<GateGuard> {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.stopping {
            return Err(SnapshotError::ShuttingDown);
        }
        state.active += 1;
        Ok(GateGuard { gate: Arc::clone(self) })
    }

    /// Flip the gate and block until active work drained.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.stopping = true;
        while state.active > 0 {
            state = self.drained.wait(state).expect("gate lock poisoned");
        }
    }
}

/// Active-work token; leaving the gate happens on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<ShutdownGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().expect("gate lock poisoned");
        state.active -= 1;
        if state.active == 0 {
            self.gate.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_enter_and_drop() {
        let gate = ShutdownGate::new();
        let guard = gate.enter().unwrap();
        drop(guard);
        gate.stop();
        assert_eq!(gate.check().unwrap_err(), SnapshotError::ShuttingDown);
    }

    #[test]
    fn test_stop_waits_for_drain() {
        let gate = ShutdownGate::new();
        let guard = gate.enter().unwrap();

        let stopper = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.stop())
        };

        // The stopper must still be blocked while the guard is live.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!stopper.is_finished());

        drop(guard);
        stopper.join().unwrap();
    }

    #[test]
    fn test_no_entry_during_shutdown() {
        let gate = ShutdownGate::new();
        gate.stop();
        assert!(matches!(gate.enter(), Err(SnapshotError::ShuttingDown)));
    }
}
