// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cooperative shutdown: a process-wide latch plus a registry of the
//! components that must quiesce before exit.
//!
//! [`Coordinator::initiate_shutdown`] flips the latch. Workers notice it
//! through cheap [`Receiver`] handles at their own safe points (a recorder
//! checks between packets and between segments) and wind down on their own;
//! nothing here preempts anything. The registry tracks each component's
//! lifecycle state so the supervisor can wait for quiescence with a deadline
//! and name whatever overran it.
//!
//! Everything is synchronous. Recorders and the supervisor are plain
//! threads, so the latch is a mutex-guarded flag with a condvar rather than
//! anything future-shaped.

use std::sync::Arc;
use std::time::Duration;

use crate::Condvar;
use crate::Mutex;

/// Returned by [`Receiver::check`] and [`Receiver::wait_for`] once shutdown
/// has been requested.
#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ComponentKind {
    Supervisor,
    Recorder,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ComponentState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Teardown priority for stream recorders; lower values are torn down
/// earlier.
pub const RECORDER_PRIORITY: u8 = 10;
pub const SUPERVISOR_PRIORITY: u8 = 20;

struct Component {
    name: String,
    kind: ComponentKind,
    priority: u8,
    state: ComponentState,
}

struct Inner {
    /// The latch. Sticky: set exactly once, never cleared.
    latched: Mutex<bool>,
    latch_changed: Condvar,

    /// Registered components. Slots are never removed; a finished
    /// component's entry stays behind (marked stopped) so laggards can be
    /// named at exit.
    components: Mutex<Vec<Component>>,
    state_changed: Condvar,
}

/// Process-wide registry of components participating in graceful shutdown.
#[derive(Clone)]
pub struct Coordinator(Arc<Inner>);

/// Checks and waits on the shutdown latch. Cheap to clone into workers.
#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.latched.lock() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks for up to `timeout`. `Ok` means the timeout passed without a
    /// shutdown request.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.latched.lock();
        let (l, _) = self
            .0
            .latch_changed
            .wait_timeout_while(l, timeout, |latched| !*latched);
        if *l {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator(Arc::new(Inner {
            latched: Mutex::new(false),
            latch_changed: Condvar::new(),
            components: Mutex::new(Vec::new()),
            state_changed: Condvar::new(),
        }))
    }

    /// Registers a component in state [`ComponentState::Starting`].
    pub fn register(&self, name: &str, kind: ComponentKind, priority: u8) -> Registration {
        let mut l = self.0.components.lock();
        l.push(Component {
            name: name.to_owned(),
            kind,
            priority,
            state: ComponentState::Starting,
        });
        Registration {
            inner: self.0.clone(),
            key: l.len() - 1,
        }
    }

    /// Latches the shutdown signal. Idempotent.
    pub fn initiate_shutdown(&self) {
        let mut l = self.0.latched.lock();
        if !*l {
            *l = true;
            drop(l);
            self.0.latch_changed.notify_all();
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        *self.0.latched.lock()
    }

    /// Returns a handle on the shutdown latch.
    pub fn receiver(&self) -> Receiver {
        Receiver(self.0.clone())
    }

    /// Waits up to `deadline` for every registered component to reach
    /// [`ComponentState::Stopped`].
    ///
    /// On timeout, returns the names of the laggards ordered by teardown
    /// priority.
    pub fn wait_for_quiescence(&self, deadline: Duration) -> Result<(), Vec<String>> {
        self.wait_impl(deadline, None)
    }

    /// Like [`Coordinator::wait_for_quiescence`], but ignores the named
    /// component — a registered component waiting on its peers would
    /// otherwise wait on itself.
    pub fn wait_for_quiescence_except(
        &self,
        deadline: Duration,
        except: &str,
    ) -> Result<(), Vec<String>> {
        self.wait_impl(deadline, Some(except))
    }

    fn wait_impl(&self, deadline: Duration, except: Option<&str>) -> Result<(), Vec<String>> {
        let waiting = |c: &Component| {
            c.state != ComponentState::Stopped && Some(c.name.as_str()) != except
        };
        let l = self.0.components.lock();
        let (l, _) = self
            .0
            .state_changed
            .wait_timeout_while(l, deadline, |components| {
                components.iter().any(|c| waiting(c))
            });
        let mut laggards: Vec<_> = l
            .iter()
            .filter(|c| waiting(c))
            .map(|c| (c.priority, c.name.clone()))
            .collect();
        if laggards.is_empty() {
            return Ok(());
        }
        laggards.sort();
        Err(laggards.into_iter().map(|(_, name)| name).collect())
    }
}

/// A component's handle on the [`Coordinator`].
///
/// Dropping the registration marks the component stopped, so a worker thread
/// that simply returns (or panics while unwinding) still quiesces.
pub struct Registration {
    inner: Arc<Inner>,
    key: usize,
}

impl Registration {
    pub fn update_state(&self, state: ComponentState) {
        {
            let mut l = self.inner.components.lock();
            if let Some(c) = l.get_mut(self.key) {
                c.state = state;
            }
        }
        self.inner.state_changed.notify_all();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.update_state(ComponentState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_sticky_and_idempotent() {
        let c = Coordinator::new();
        let rx = c.receiver();
        assert!(!c.is_shutdown_initiated());
        rx.check().unwrap();
        c.initiate_shutdown();
        c.initiate_shutdown();
        assert!(c.is_shutdown_initiated());
        rx.check().unwrap_err();
        // A receiver taken after the latch sees the same state.
        c.receiver().check().unwrap_err();
    }

    #[test]
    fn wait_for_returns_ok_on_timeout_and_err_on_latch() {
        let c = Coordinator::new();
        let rx = c.receiver();
        rx.wait_for(Duration::from_millis(0)).unwrap();

        let h = std::thread::spawn({
            let rx = rx.clone();
            move || rx.wait_for(Duration::from_secs(1000))
        });
        // Give the waiter a chance to reach the condvar before latching.
        std::thread::sleep(Duration::from_millis(10));
        c.initiate_shutdown();
        h.join().unwrap().unwrap_err();
    }

    #[test]
    fn quiescence_names_laggards_in_priority_order() {
        let c = Coordinator::new();
        let sup = c.register("supervisor", ComponentKind::Supervisor, SUPERVISOR_PRIORITY);
        let rec = c.register("s-back", ComponentKind::Recorder, RECORDER_PRIORITY);
        sup.update_state(ComponentState::Running);
        rec.update_state(ComponentState::Running);

        let laggards = c
            .wait_for_quiescence(Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(laggards, vec!["s-back".to_owned(), "supervisor".to_owned()]);

        c.wait_for_quiescence_except(Duration::from_millis(10), "supervisor")
            .unwrap_err();
        rec.update_state(ComponentState::Stopped);
        c.wait_for_quiescence_except(Duration::from_millis(10), "supervisor")
            .unwrap();

        sup.update_state(ComponentState::Stopped);
        c.wait_for_quiescence(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn dropping_registration_marks_stopped() {
        let c = Coordinator::new();
        let r = c.register("s-front", ComponentKind::Recorder, RECORDER_PRIORITY);
        r.update_state(ComponentState::Running);
        drop(r);
        c.wait_for_quiescence(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn quiescence_wakes_on_state_change() {
        let c = Coordinator::new();
        let r = c.register("s-front", ComponentKind::Recorder, RECORDER_PRIORITY);
        r.update_state(ComponentState::Running);
        let c2 = c.clone();
        let h = std::thread::spawn(move || c2.wait_for_quiescence(Duration::from_secs(1000)));
        std::thread::sleep(Duration::from_millis(10));
        drop(r);
        h.join().unwrap().unwrap();
    }
}
