//! Named pause points for tests.
//!
//! Build loops call `PauseClient::wait(label)` at designated hang points. In
//! production builds this is a no-op; under the `testing` feature a
//! `PauseController` can block the build thread at a label, optionally
//! inject an error, and then release it.

#[derive(Default)]
pub enum Fault {
    #[default]
    Noop,
    Error(anyhow::Error),
}

#[cfg(any(test, feature = "testing"))]
mod test_pause {
    use std::{
        collections::BTreeMap,
        mem,
        sync::{
            mpsc,
            Arc,
        },
    };

    use parking_lot::Mutex;

    use super::Fault;

    // A pair of zero-capacity channels per label. The controller blocks on
    // the "pause" send until the build thread arrives at the label, then the
    // build thread blocks on the "resume" receive until the controller
    // releases it.
    struct Rendezvous {
        paused_rx: mpsc::Receiver<()>,
        resume_rx: mpsc::Receiver<Fault>,
    }

    #[derive(Default, Clone)]
    pub struct PauseClient {
        channels: Arc<Mutex<BTreeMap<&'static str, Rendezvous>>>,
    }

    impl PauseClient {
        /// Create a new, disconnected `PauseClient`. To actually set up
        /// pause points, use `PauseController`'s constructor.
        pub fn new() -> Self {
            Self {
                channels: Arc::new(Mutex::new(BTreeMap::new())),
            }
        }

        /// Block at the named pause point until the controller releases it.
        /// Unregistered labels return immediately.
        pub fn wait(&self, label: &'static str) -> Fault {
            let rendezvous = match self.channels.lock().remove(&label) {
                Some(r) => r,
                None => return Fault::Noop,
            };
            tracing::info!("Waiting on pause point {label}");
            if rendezvous.paused_rx.recv().is_err() {
                tracing::info!("Rendezvous disconnected for {label:?}, continuing...");
                return Fault::Noop;
            }
            let Ok(fault) = rendezvous.resume_rx.recv() else {
                tracing::info!("Rendezvous disconnected after pause for {label:?}, continuing...");
                return Fault::Noop;
            };
            tracing::info!("PauseController released {label}");
            self.channels.lock().insert(label, rendezvous);
            fault
        }
    }

    struct ControllerSide {
        paused_tx: mpsc::SyncSender<()>,
        resume_tx: mpsc::SyncSender<Fault>,
    }

    pub struct PauseController {
        channels: BTreeMap<&'static str, ControllerSide>,
    }

    pub struct PauseGuard<'a> {
        controller: &'a mut PauseController,
        label: &'static str,
        released: bool,
        fault: Fault,
    }

    impl PauseGuard<'_> {
        pub fn inject_error(&mut self, error: anyhow::Error) {
            self.fault = Fault::Error(error);
        }

        /// Allow the paused thread to resume.
        pub fn unpause(&mut self) {
            if self.released {
                return;
            }
            self.released = true;
            let Some(side) = self.controller.channels.get_mut(&self.label) else {
                return;
            };
            let fault = mem::take(&mut self.fault);
            if let Err(e) = side.resume_tx.try_send(fault) {
                tracing::info!("Failed to release pause point {:?}: {e:?}", self.label);
                self.controller.channels.remove(&self.label);
            }
        }
    }

    impl Drop for PauseGuard<'_> {
        fn drop(&mut self) {
            if !self.released {
                tracing::info!("Releasing pause point {:?} on unclean drop", self.label);
                self.unpause();
            }
        }
    }

    impl PauseController {
        /// Create a `PauseController` with a list of named pause points, and
        /// install the returned `PauseClient` in the tested code.
        pub fn new(labels: impl IntoIterator<Item = &'static str>) -> (Self, PauseClient) {
            let mut controller = Self {
                channels: BTreeMap::new(),
            };
            let client = PauseClient::new();
            for label in labels {
                let (paused_tx, paused_rx) = mpsc::sync_channel(0);
                let (resume_tx, resume_rx) = mpsc::sync_channel(0);
                controller.channels.insert(
                    label,
                    ControllerSide {
                        paused_tx,
                        resume_tx,
                    },
                );
                client.channels.lock().insert(
                    label,
                    Rendezvous {
                        paused_rx,
                        resume_rx,
                    },
                );
            }
            (controller, client)
        }

        /// Block until the tested code reaches the named pause point,
        /// returning a `PauseGuard` holding it there. If the tested code has
        /// exited or manually closed the pause point, return `None`.
        pub fn wait_for_blocked(&mut self, label: &'static str) -> Option<PauseGuard<'_>> {
            let side = match self.channels.get_mut(&label) {
                Some(s) => s,
                None => {
                    tracing::info!("Waiting on unregistered pause point: {label:?}");
                    return None;
                },
            };
            if side.paused_tx.send(()).is_err() {
                tracing::info!("Waiter closed for {label:?}");
                self.channels.remove(&label);
                return None;
            }
            Some(PauseGuard {
                controller: self,
                label,
                released: false,
                fault: Fault::Noop,
            })
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use self::test_pause::{
    PauseClient,
    PauseController,
};

#[cfg(not(any(test, feature = "testing")))]
mod prod_pause {
    use super::Fault;

    #[derive(Default, Clone)]
    pub struct PauseClient;

    impl PauseClient {
        pub fn new() -> Self {
            Self
        }

        pub fn wait(&self, _label: &'static str) -> Fault {
            Fault::Noop
        }
    }
}

#[cfg(not(any(test, feature = "testing")))]
pub use self::prod_pause::PauseClient;
