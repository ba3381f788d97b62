//! Acquisition loop: drives sessions against the selected device and feeds
//! decoded readings to the consumer.
//!
//! Sessions run strictly one after another inside this loop, so there is never
//! more than one open session. Every failure is handed to the shared
//! [`Backoff`] as data; nothing here is fatal. A [`Shutdown`] request ends the
//! loop between or during sessions, and the open link is released on the way out.

use crate::backoff::{BACKOFF_FLOOR, Backoff};
use crate::mac_address::MacAddress;
use crate::reading::Reading;
use crate::selector::DeviceSelector;
use crate::session::{Radio, Session, SessionConfig, SessionError, Shutdown};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

/// How readings are obtained from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Mode {
    /// Passively decode broadcast advertisements
    Advert,
    /// Connect, wait for one reading, disconnect, repeat
    #[default]
    Poll,
    /// Stay connected and stream every notification
    Stream,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Advert => write!(f, "advert"),
            Mode::Poll => write!(f, "poll"),
            Mode::Stream => write!(f, "stream"),
        }
    }
}

/// Static parameters of the acquisition loop.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub mode: Mode,
    pub session: SessionConfig,
    pub max_backoff: Duration,
    /// Sleep after a successful poll
    pub idle_between_cycles: Duration,
}

/// Owns the transport, the device selection and the retry policy.
pub struct Acquisition {
    radio: Arc<dyn Radio>,
    selector: DeviceSelector,
    backoff: Backoff,
    config: AcquireConfig,
    out: mpsc::Sender<Reading>,
    shutdown: Shutdown,
}

impl Acquisition {
    pub fn new(
        radio: Arc<dyn Radio>,
        selector: DeviceSelector,
        config: AcquireConfig,
        out: mpsc::Sender<Reading>,
    ) -> Self {
        let backoff = Backoff::new(BACKOFF_FLOOR, config.max_backoff);
        Acquisition {
            radio,
            selector,
            backoff,
            config,
            out,
            shutdown: Shutdown::default(),
        }
    }

    /// Stop the loop, including any running session, when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run until the reading consumer goes away or shutdown is requested.
    pub async fn run(mut self) {
        let mut waiting_logged = false;

        loop {
            if self.out.is_closed() || self.shutdown.is_requested() {
                break;
            }

            // A selection change only takes effect here, between attempts.
            let Some(address) = self.selector.resolve(Instant::now()) else {
                if !waiting_logged {
                    info!("No device selected yet, waiting for a selection");
                    waiting_logged = true;
                }
                let refresh = self.selector.refresh_interval();
                self.pause(refresh).await;
                continue;
            };
            waiting_logged = false;

            let outcome = match self.config.mode {
                Mode::Advert => self.listen(address).await,
                Mode::Poll => self.poll_once(address).await,
                Mode::Stream => self.stream(address).await,
            };

            match outcome {
                Ok(()) => {
                    self.backoff.reset();
                    self.pause(self.config.idle_between_cycles).await;
                }
                Err(SessionError::Shutdown) => break,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    match e {
                        // Expected while the device sleeps between advertising bursts
                        SessionError::ScanTimeout { .. } => {
                            info!("{e}; next attempt in {delay:?}")
                        }
                        _ => warn!("{e}; next attempt in {delay:?}"),
                    }
                    self.pause(delay).await;
                }
            }
        }

        debug!("Acquisition stopped");
    }

    /// Sleep for `delay` unless shutdown is requested first.
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.shutdown.requested() => {}
        }
    }

    async fn poll_once(&mut self, address: MacAddress) -> Result<(), SessionError> {
        let mut session = Session::new(self.radio.as_ref(), address, &self.config.session)
            .with_shutdown(self.shutdown.clone());
        let active = session.open().await?;
        info!("Connected to {address}");

        let reading = active.read_window().await?;
        debug!("[GATT] {address} -> {reading}");
        self.out
            .send(reading)
            .await
            .map_err(|_| SessionError::Shutdown)
    }

    async fn stream(&mut self, address: MacAddress) -> Result<(), SessionError> {
        let mut session = Session::new(self.radio.as_ref(), address, &self.config.session)
            .with_shutdown(self.shutdown.clone());
        let active = session.open().await?;
        info!("Connected to {address} (persistent)");
        self.backoff.reset();

        let end = active.stream(&self.out).await;
        info!("Stream from {address} ended after {} readings", end.delivered);
        Err(end.error)
    }

    async fn listen(&mut self, address: MacAddress) -> Result<(), SessionError> {
        let mut session = Session::new(self.radio.as_ref(), address, &self.config.session)
            .with_shutdown(self.shutdown.clone());
        info!("Listening for advertisements from {address}");

        let end = session.listen(&self.out).await;
        if end.delivered > 0 {
            self.backoff.reset();
        }
        Err(end.error)
    }
}
