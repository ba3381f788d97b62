//! Lifecycle of a single wireless session with the selected thermometer.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Active -> Closed
//!            |            |           |
//!            +------------+-----------+----> Failed
//! ```
//!
//! The transport is abstracted behind [`Radio`] and [`Link`] so the state
//! machine can be exercised without Bluetooth hardware. Every wait has a
//! timeout and can be cut short by a [`Shutdown`] request. A [`Link`]
//! obtained by [`Session::open`] is released exactly once whichever way the
//! attempt ends, including when the attempt itself is dropped.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::decoder::{decode_advertisement, decode_notification, hex};
use crate::mac_address::MacAddress;
use crate::reading::Reading;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout, timeout_at};

/// Channel buffer size for frames pushed by a transport.
pub const FRAME_CHANNEL_BUFFER_SIZE: usize = 32;

/// Ways a session attempt can end other than a normal close.
///
/// All of these are transient: the acquisition loop backs off and retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("{address} not seen advertising within {timeout:?}")]
    ScanTimeout { address: MacAddress, timeout: Duration },
    #[error("connecting to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: MacAddress, timeout: Duration },
    #[error("no notification from {address} within {timeout:?}")]
    ReadTimeout { address: MacAddress, timeout: Duration },
    #[error("{address} disconnected after {elapsed:?}")]
    Disconnected { address: MacAddress, elapsed: Duration },
    #[error("advertisement listener for {address} stopped")]
    ListenerClosed { address: MacAddress },
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(String),
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("reading consumer went away")]
    Shutdown,
}

/// Session states; `Closed` and `Failed` are terminal for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Active,
    Closed,
    Failed,
}

/// Boxed future returned by transport operations.
pub type RadioFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// One MiBeacon advertisement as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub rssi: Option<i16>,
    /// Service data for UUID `0xFE95`
    pub service_data: Vec<u8>,
}

/// Bluetooth transport abstraction to enable tests without hardware.
pub trait Radio: Send + Sync {
    /// Complete once `address` has been seen advertising.
    fn discover(&self, address: MacAddress) -> RadioFuture<'_, ()>;

    /// Connect to `address` and locate the notification characteristic.
    fn connect(&self, address: MacAddress) -> RadioFuture<'_, Box<dyn Link>>;

    /// Best-effort teardown after a connect attempt was abandoned.
    fn abort_connect(&self, address: MacAddress) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Deliver advertisements from `address` until the receiver is dropped.
    fn listen(&self, address: MacAddress) -> RadioFuture<'_, mpsc::Receiver<Advertisement>>;
}

/// An established connection.
pub trait Link: Send {
    /// Start notifications; the channel closes when the device disconnects.
    fn subscribe(&mut self) -> RadioFuture<'_, mpsc::Receiver<Vec<u8>>>;

    /// Stop notifications and disconnect.
    fn release(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Timeouts and decoding parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Read window in periodic mode, inactivity limit in streaming mode
    pub read_window: Duration,
    pub humidity_scale: f64,
    /// Advertisements weaker than this are ignored (dBm)
    pub min_rssi: i16,
    /// Log raw frame bytes at info level
    pub print_raw: bool,
}

/// How a long-running session (streaming or listening) ended.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnd {
    /// Readings forwarded before the session ended
    pub delivered: usize,
    pub error: SessionError,
}

/// Cooperative stop request shared by the run loop and every session.
///
/// The default value never fires. Once requested, a session ends its current
/// wait with [`SessionError::Shutdown`] and releases its link before returning.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Option<watch::Receiver<bool>>,
}

impl Shutdown {
    /// A stop signal together with the sender that triggers it (`true`).
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { requested: Some(rx) })
    }

    pub fn is_requested(&self) -> bool {
        self.requested.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Complete once a stop was requested or its sender went away.
    pub async fn requested(&mut self) {
        let Some(rx) = self.requested.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owns a link until it is released.
///
/// Dropping a guard that still holds its link (an attempt cancelled mid-way)
/// hands the release to the runtime instead of leaking the connection.
struct LinkGuard {
    link: Option<Box<dyn Link>>,
}

impl LinkGuard {
    fn new(link: Box<dyn Link>) -> Self {
        LinkGuard { link: Some(link) }
    }

    fn subscribe(&mut self) -> RadioFuture<'_, mpsc::Receiver<Vec<u8>>> {
        match self.link.as_mut() {
            Some(link) => link.subscribe(),
            None => Box::pin(async { Err(SessionError::Bluetooth("link already released".into())) }),
        }
    }

    async fn release(mut self) {
        if let Some(link) = self.link.take() {
            link.release().await;
        }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(link.release());
            }
            Err(_) => warn!("Link dropped outside the runtime, connection not released"),
        }
    }
}

/// A single attempt against one device.
pub struct Session<'a> {
    radio: &'a dyn Radio,
    address: MacAddress,
    config: &'a SessionConfig,
    state: SessionState,
    shutdown: Shutdown,
}

impl<'a> Session<'a> {
    pub fn new(radio: &'a dyn Radio, address: MacAddress, config: &'a SessionConfig) -> Self {
        Session {
            radio,
            address,
            config,
            state: SessionState::Idle,
            shutdown: Shutdown::default(),
        }
    }

    /// End the attempt early when `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    fn set_state(&mut self, next: SessionState) {
        debug!("{}: {:?} -> {:?}", self.address, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: SessionError) -> SessionError {
        self.set_state(SessionState::Failed);
        error
    }

    /// Scan for the device, connect and subscribe to notifications.
    pub async fn open(&mut self) -> Result<ActiveSession, SessionError> {
        let mut shutdown = self.shutdown.clone();
        let opened = tokio::select! {
            opened = self.establish() => Some(opened),
            _ = shutdown.requested() => None,
        };

        match opened {
            Some(opened) => opened,
            None => {
                // A link still being subscribed was released by its guard.
                self.radio.abort_connect(self.address).await;
                Err(self.fail(SessionError::Shutdown))
            }
        }
    }

    async fn establish(&mut self) -> Result<ActiveSession, SessionError> {
        let radio = self.radio;
        let address = self.address;
        let config = self.config;

        self.set_state(SessionState::Scanning);
        match timeout(config.scan_timeout, radio.discover(address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => {
                return Err(self.fail(SessionError::ScanTimeout {
                    address,
                    timeout: config.scan_timeout,
                }));
            }
        }

        self.set_state(SessionState::Connecting);
        let connect_timeout = SessionError::ConnectTimeout {
            address,
            timeout: config.connect_timeout,
        };
        let mut link = match timeout(config.connect_timeout, radio.connect(address)).await {
            Ok(Ok(link)) => LinkGuard::new(link),
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => {
                radio.abort_connect(address).await;
                return Err(self.fail(connect_timeout));
            }
        };

        let subscribed = timeout(config.connect_timeout, link.subscribe()).await;
        let frames = match subscribed {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => {
                link.release().await;
                return Err(self.fail(e));
            }
            Err(_) => {
                link.release().await;
                return Err(self.fail(connect_timeout));
            }
        };

        self.set_state(SessionState::Active);
        Ok(ActiveSession {
            address,
            link,
            frames,
            config: config.clone(),
            shutdown: self.shutdown.clone(),
            opened_at: Instant::now(),
        })
    }

    /// Passively listen for the device's advertisements, forwarding every
    /// decodable reading to `out`.
    ///
    /// Ends with [`SessionError::ScanTimeout`] when the device stays silent for
    /// the scan timeout, or when the listener or the consumer goes away.
    pub async fn listen(&mut self, out: &mpsc::Sender<Reading>) -> StreamEnd {
        let radio = self.radio;
        let address = self.address;
        let config = self.config;
        let mut shutdown = self.shutdown.clone();

        self.set_state(SessionState::Scanning);
        let mut adverts = match radio.listen(address).await {
            Ok(adverts) => adverts,
            Err(e) => {
                return StreamEnd {
                    delivered: 0,
                    error: self.fail(e),
                };
            }
        };

        let mut delivered = 0;
        let error = loop {
            let received = tokio::select! {
                received = timeout(config.scan_timeout, adverts.recv()) => received,
                _ = shutdown.requested() => break SessionError::Shutdown,
            };
            let advert = match received {
                Ok(Some(advert)) => advert,
                Ok(None) => break SessionError::ListenerClosed { address },
                Err(_) => {
                    break SessionError::ScanTimeout {
                        address,
                        timeout: config.scan_timeout,
                    };
                }
            };

            if let Some(rssi) = advert.rssi
                && rssi < config.min_rssi
            {
                debug!("{address}: ignoring advertisement at {rssi} dBm");
                continue;
            }
            if config.print_raw {
                info!("[RAW] {address} {}", hex(&advert.service_data));
            }

            let (reading, debug_info) =
                decode_advertisement(&advert.service_data, SystemTime::now());
            if let Some(debug_info) = debug_info {
                debug!("[FE95] addr={address} RSSI={:?} {debug_info}", advert.rssi);
            }
            if let Some(reading) = reading {
                if out.send(reading).await.is_err() {
                    break SessionError::Shutdown;
                }
                delivered += 1;
            }
        };

        // Dropping the receiver stops the transport's listener.
        drop(adverts);
        StreamEnd {
            delivered,
            error: self.fail(error),
        }
    }
}

/// A connected, subscribed session. Consumed by whichever phase runs next,
/// which always releases the link before returning.
pub struct ActiveSession {
    address: MacAddress,
    link: LinkGuard,
    frames: mpsc::Receiver<Vec<u8>>,
    config: SessionConfig,
    shutdown: Shutdown,
    opened_at: Instant,
}

impl ActiveSession {
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Collect notifications for at most the read window.
    ///
    /// Returns as soon as both temperature and humidity are known. When the
    /// window ends or the device disconnects, whatever was collected is
    /// returned; receiving nothing at all is an error.
    pub async fn read_window(mut self) -> Result<Reading, SessionError> {
        let result = self.collect_window().await;
        self.close().await;
        result
    }

    /// Forward every notification to `out` until the device disconnects or
    /// stays silent for longer than the read window.
    pub async fn stream(mut self, out: &mpsc::Sender<Reading>) -> StreamEnd {
        let end = self.forward_all(out).await;
        self.close().await;
        end
    }

    async fn collect_window(&mut self) -> Result<Reading, SessionError> {
        let deadline = Instant::now() + self.config.read_window;
        let mut collected = Reading::empty(SystemTime::now());

        loop {
            let received = tokio::select! {
                received = timeout_at(deadline, self.frames.recv()) => received,
                _ = self.shutdown.requested() => return Err(SessionError::Shutdown),
            };
            match received {
                Ok(Some(bytes)) => {
                    collected.absorb(&self.decode(&bytes));
                    if collected.has_climate() {
                        return Ok(collected);
                    }
                }
                Ok(None) if collected.is_empty() => {
                    return Err(SessionError::Disconnected {
                        address: self.address,
                        elapsed: self.opened_at.elapsed(),
                    });
                }
                Err(_) if collected.is_empty() => {
                    return Err(SessionError::ReadTimeout {
                        address: self.address,
                        timeout: self.config.read_window,
                    });
                }
                Ok(None) | Err(_) => return Ok(collected),
            }
        }
    }

    async fn forward_all(&mut self, out: &mpsc::Sender<Reading>) -> StreamEnd {
        let mut delivered = 0;
        let error = loop {
            let received = tokio::select! {
                received = timeout(self.config.read_window, self.frames.recv()) => received,
                _ = self.shutdown.requested() => break SessionError::Shutdown,
            };
            match received {
                Ok(Some(bytes)) => {
                    let reading = self.decode(&bytes);
                    if reading.is_empty() {
                        continue;
                    }
                    if out.send(reading).await.is_err() {
                        break SessionError::Shutdown;
                    }
                    delivered += 1;
                }
                Ok(None) => {
                    break SessionError::Disconnected {
                        address: self.address,
                        elapsed: self.opened_at.elapsed(),
                    };
                }
                Err(_) => {
                    break SessionError::ReadTimeout {
                        address: self.address,
                        timeout: self.config.read_window,
                    };
                }
            }
        };
        StreamEnd { delivered, error }
    }

    fn decode(&self, bytes: &[u8]) -> Reading {
        if self.config.print_raw {
            info!("[RAW] {} {}", self.address, hex(bytes));
        }
        let reading = decode_notification(bytes, self.config.humidity_scale, SystemTime::now());
        if reading.is_empty() {
            debug!(
                "{}: ignoring {}-byte notification {}",
                self.address,
                bytes.len(),
                hex(bytes)
            );
        }
        reading
    }

    async fn close(self) {
        let ActiveSession { address, link, .. } = self;
        link.release().await;
        debug!("{address}: {:?} -> {:?}", SessionState::Active, SessionState::Closed);
    }
}
