//! Library rescan trigger
//!
//! Asks the e-reader to refresh its library index. When the rescan service is
//! reachable the trigger runs a three-step protocol:
//!
//! 1. subscribe to the completion signal,
//! 2. request the rescan,
//! 3. wait for the signal, bounded by a timeout and the caller's cancellation.
//!
//! The subscription must exist before the request is sent, otherwise a fast
//! device could emit the signal before anyone listens for it.
//!
//! Without the service the trigger simulates unplugging and replugging USB by
//! writing to the hardware status channel. That path has no confirmation and
//! always reports success.

use crate::error::RescanError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NICKEL_DBUS_INTERFACE: &str = "com.github.shermp.nickeldbus";
pub const NICKEL_DBUS_PATH: &str = "/nickeldbus";
pub const RESCAN_DONE_SIGNAL: &str = "pfmDoneProcessing";

pub const HOTPLUG_ADD: &str = "usb plug add";
pub const HOTPLUG_REMOVE: &str = "usb plug remove";

/// Fully qualified name of the completion signal
pub fn done_signal_name() -> String {
    format!("{}.{}", NICKEL_DBUS_INTERFACE, RESCAN_DONE_SIGNAL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanKind {
    Partial,
    Full,
}

impl RescanKind {
    pub fn method(self) -> &'static str {
        match self {
            RescanKind::Partial => "pfmRescanBooks",
            RescanKind::Full => "pfmRescanBooksFull",
        }
    }
}

/// The on-device service that rescans the library
#[async_trait]
pub trait RescanService: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Start listening for signals; every received signal is sent as `interface.member`
    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, RescanError>;

    async fn request_rescan(&self, kind: RescanKind) -> Result<(), RescanError>;
}

/// Write side of the virtual hardware status channel
#[async_trait]
pub trait HardwareStatusChannel: Send + Sync {
    async fn write(&self, event: &str) -> io::Result<()>;
}

/// Trigger progress, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanState {
    Idle,
    Detecting,
    RescanServiceAvailable,
    Requesting,
    WaitingForSignal,
    ServiceUnavailable,
    SimulatingHotplug,
    Done,
    TimedOut,
}

impl fmt::Display for RescanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RescanState::Idle => "idle",
            RescanState::Detecting => "detecting",
            RescanState::RescanServiceAvailable => "rescan service available",
            RescanState::Requesting => "requesting",
            RescanState::WaitingForSignal => "waiting for signal",
            RescanState::ServiceUnavailable => "service unavailable",
            RescanState::SimulatingHotplug => "simulating hotplug",
            RescanState::Done => "done",
            RescanState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// How the library refresh was achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanOutcome {
    Rescanned,
    HotplugSimulated,
}

pub struct LibraryRescanTrigger<S, H> {
    service: S,
    hardware: H,
    kind: RescanKind,
    hotplug_pause: Duration,
    state: RescanState,
}

impl<S, H> LibraryRescanTrigger<S, H>
where
    S: RescanService,
    H: HardwareStatusChannel,
{
    pub fn new(service: S, hardware: H, kind: RescanKind, hotplug_pause: Duration) -> Self {
        Self {
            service,
            hardware,
            kind,
            hotplug_pause,
            state: RescanState::Idle,
        }
    }

    pub fn state(&self) -> RescanState {
        self.state
    }

    fn transition(&mut self, next: RescanState) {
        debug!("Library rescan: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Refresh the library, waiting at most `budget` for the completion signal
    pub async fn run(
        &mut self,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<RescanOutcome, RescanError> {
        self.transition(RescanState::Detecting);

        if self.service.is_available().await {
            self.transition(RescanState::RescanServiceAvailable);
            self.rescan(budget, cancel).await?;
            Ok(RescanOutcome::Rescanned)
        } else {
            self.transition(RescanState::ServiceUnavailable);
            self.simulate_hotplug(cancel).await;
            Ok(RescanOutcome::HotplugSimulated)
        }
    }

    async fn rescan(&mut self, budget: Duration, cancel: &CancellationToken) -> Result<(), RescanError> {
        let mut signals = self.service.subscribe().await?;

        self.transition(RescanState::Requesting);
        info!("Requesting {:?} library rescan", self.kind);
        self.service.request_rescan(self.kind).await?;

        self.transition(RescanState::WaitingForSignal);
        let expected = done_signal_name();

        tokio::select! {
            _ = cancel.cancelled() => Err(RescanError::Cancelled),
            _ = tokio::time::sleep(budget) => {
                self.transition(RescanState::TimedOut);
                Err(RescanError::Timeout(budget))
            }
            received = signals.recv() => match received {
                Some(name) if name == expected => {
                    self.transition(RescanState::Done);
                    info!("Library rescan completed");
                    Ok(())
                }
                Some(name) => Err(RescanError::SignalMismatch { expected, got: name }),
                None => Err(RescanError::ChannelClosed),
            },
        }
    }

    /// Plug, pause, unplug. Cancellation only shortens the pause; the unplug
    /// event is always written so Nickel leaves USB mode.
    async fn simulate_hotplug(&mut self, cancel: &CancellationToken) {
        self.transition(RescanState::SimulatingHotplug);
        info!("Rescan service not available, simulating USB plug events");

        if let Err(e) = self.hardware.write(HOTPLUG_ADD).await {
            warn!("Failed to write '{}': {}", HOTPLUG_ADD, e);
        }

        tokio::select! {
            _ = cancel.cancelled() => warn!("Cancelled during USB plug pause, unplugging now"),
            _ = tokio::time::sleep(self.hotplug_pause) => {}
        }

        if let Err(e) = self.hardware.write(HOTPLUG_REMOVE).await {
            warn!("Failed to write '{}': {}", HOTPLUG_REMOVE, e);
        }

        self.transition(RescanState::Done);
    }
}
