// OS signal handling
//
// Operator-registered signal callbacks, dispatched on the control task.
// A watcher task per registered signal forwards deliveries as control
// requests; the control loop then invokes the callback with a control
// handle, so the usual reaction (request shutdown) is one call away.
// Callbacks never run on the signal watcher task itself.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::dispatcher::{ControlHandle, ControlRequest};

/// OS signals the dispatcher can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl Signal {
    /// Canonical signal name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on the control task when a registered signal fires.
pub type SignalCallback = Box<dyn FnMut(Signal, &ControlHandle) + Send>;

/// Ordered table of registered signal callbacks.
///
/// Indexed by registration order; the watcher for entry `i` posts
/// `ControlRequest::Signal(i)` on every delivery.
#[derive(Default)]
pub(crate) struct SignalTable {
    entries: Vec<(Signal, SignalCallback)>,
}

impl SignalTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, signal: Signal, callback: SignalCallback) {
        self.entries.push((signal, callback));
    }

    /// Spawn one watcher task per registered callback.
    ///
    /// Watchers stop once the control channel closes.
    pub(crate) fn spawn_watchers(
        &self,
        control_tx: mpsc::UnboundedSender<ControlRequest>,
    ) -> Vec<JoinHandle<()>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, (signal, _))| tokio::spawn(watch(*signal, index, control_tx.clone())))
            .collect()
    }

    /// Invoke the callback at `index` with the given control handle.
    pub(crate) fn invoke(&mut self, index: usize, control: &ControlHandle) {
        if let Some((signal, callback)) = self.entries.get_mut(index) {
            debug!(signal = %signal, "Invoking signal callback");
            callback(*signal, control);
        }
    }
}

#[cfg(unix)]
async fn watch(signal: Signal, index: usize, control_tx: mpsc::UnboundedSender<ControlRequest>) {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let kind = match signal {
        Signal::Interrupt => SignalKind::interrupt(),
        Signal::Terminate => SignalKind::terminate(),
    };
    let mut stream = match unix_signal(kind) {
        Ok(stream) => stream,
        Err(e) => {
            error!(signal = %signal, error = %e, "Failed to install signal watcher");
            return;
        }
    };

    while stream.recv().await.is_some() {
        if control_tx.send(ControlRequest::Signal(index)).is_err() {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn watch(signal: Signal, index: usize, control_tx: mpsc::UnboundedSender<ControlRequest>) {
    // Only Ctrl-C is portable; a SIGTERM watcher never fires here.
    if signal != Signal::Interrupt {
        return;
    }
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            error!(signal = %signal, "Failed to install signal watcher");
            return;
        }
        if control_tx.send(ControlRequest::Signal(index)).is_err() {
            break;
        }
    }
}
