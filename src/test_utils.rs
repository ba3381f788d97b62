use crate::mac_address::MacAddress;
use crate::output::{LogError, Record, RecordSink};
use crate::selector::{SelectionError, SelectionSource};
use crate::session::{Advertisement, Link, Radio, RadioFuture, SessionError};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Collects records in memory, optionally failing every append.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Record>,
    pub fail: bool,
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: &Record) -> Result<(), LogError> {
        if self.fail {
            return Err(io::Error::other("disk full").into());
        }
        self.records.push(record.clone());
        Ok(())
    }
}

/// Selection whose answer can be changed from the test and that counts loads.
#[derive(Debug, Clone, Default)]
pub struct SharedSelection {
    value: Arc<Mutex<Option<MacAddress>>>,
    loads: Arc<AtomicUsize>,
}

impl SharedSelection {
    pub fn new(mac: Option<MacAddress>) -> Self {
        let source = Self::default();
        source.set(mac);
        source
    }

    pub fn set(&self, mac: Option<MacAddress>) {
        *self.value.lock().unwrap() = mac;
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl SelectionSource for SharedSelection {
    fn load(&self) -> Result<Option<MacAddress>, SelectionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(*self.value.lock().unwrap())
    }
}

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x0A, 0x0B, 0x0C]);

pub fn notification(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

pub fn advert(rssi: Option<i16>, service_data: &[u8]) -> Advertisement {
    Advertisement {
        address: TEST_MAC,
        rssi,
        service_data: service_data.to_vec(),
    }
}

#[derive(Debug, Default)]
struct Counters {
    discovers: AtomicUsize,
    connects: AtomicUsize,
    aborts: AtomicUsize,
    releases: AtomicUsize,
    listens: AtomicUsize,
    /// Currently open links, to check sessions never overlap
    open_links: AtomicUsize,
    max_open_links: AtomicUsize,
    discover_times: Mutex<Vec<Instant>>,
    /// Target of every `discover`, in call order
    discover_addresses: Mutex<Vec<MacAddress>>,
    /// Senders kept alive so channels stay open
    held_adverts: Mutex<Vec<mpsc::Sender<Advertisement>>>,
}

/// Scripted [`Radio`] that counts every call.
///
/// Clones share their counters, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct FakeRadio {
    counters: Arc<Counters>,
    silent: bool,
    failing_discoveries: usize,
    hang_connect: bool,
    fail_subscribe: bool,
    notifications: Vec<Vec<u8>>,
    keep_link_open: bool,
    adverts: Vec<Advertisement>,
    keep_listener_open: bool,
}

impl FakeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// `discover` never completes.
    pub fn never_advertising(mut self) -> Self {
        self.silent = true;
        self
    }

    /// The first `n` calls to `discover` fail immediately.
    pub fn failing_discoveries(mut self, n: usize) -> Self {
        self.failing_discoveries = n;
        self
    }

    pub fn hanging_connect(mut self) -> Self {
        self.hang_connect = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    /// Frames delivered on every subscription.
    pub fn with_notifications(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.notifications = frames;
        self
    }

    /// Keep the notification channel open after the scripted frames.
    pub fn keep_link_open(mut self) -> Self {
        self.keep_link_open = true;
        self
    }

    /// Advertisements delivered on every `listen`.
    pub fn with_adverts(mut self, adverts: Vec<Advertisement>) -> Self {
        self.adverts = adverts;
        self
    }

    pub fn keep_listener_open(mut self) -> Self {
        self.keep_listener_open = true;
        self
    }

    pub fn discovers(&self) -> usize {
        self.counters.discovers.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.counters.aborts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    pub fn listens(&self) -> usize {
        self.counters.listens.load(Ordering::SeqCst)
    }

    pub fn max_open_links(&self) -> usize {
        self.counters.max_open_links.load(Ordering::SeqCst)
    }

    pub fn discover_times(&self) -> Vec<Instant> {
        self.counters.discover_times.lock().unwrap().clone()
    }

    pub fn discover_addresses(&self) -> Vec<MacAddress> {
        self.counters.discover_addresses.lock().unwrap().clone()
    }
}

impl Radio for FakeRadio {
    fn discover(&self, address: MacAddress) -> RadioFuture<'_, ()> {
        let call = self.counters.discovers.fetch_add(1, Ordering::SeqCst);
        self.counters
            .discover_addresses
            .lock()
            .unwrap()
            .push(address);
        self.counters
            .discover_times
            .lock()
            .unwrap()
            .push(Instant::now());
        Box::pin(async move {
            if self.silent {
                std::future::pending::<()>().await;
            }
            if call < self.failing_discoveries {
                return Err(SessionError::Bluetooth("device not found".into()));
            }
            Ok(())
        })
    }

    fn connect(&self, _address: MacAddress) -> RadioFuture<'_, Box<dyn Link>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if self.hang_connect {
                std::future::pending::<()>().await;
            }
            let open = self.counters.open_links.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_open_links.fetch_max(open, Ordering::SeqCst);
            let link: Box<dyn Link> = Box::new(FakeLink {
                radio: self.clone(),
                held: None,
            });
            Ok(link)
        })
    }

    fn abort_connect(&self, _address: MacAddress) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }

    fn listen(&self, _address: MacAddress) -> RadioFuture<'_, mpsc::Receiver<Advertisement>> {
        self.counters.listens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.adverts.len().max(1));
        for advert in &self.adverts {
            let _ = tx.try_send(advert.clone());
        }
        if self.keep_listener_open {
            self.counters.held_adverts.lock().unwrap().push(tx);
        }
        Box::pin(async move { Ok(rx) })
    }
}

#[derive(Debug)]
struct FakeLink {
    radio: FakeRadio,
    held: Option<mpsc::Sender<Vec<u8>>>,
}

impl Link for FakeLink {
    fn subscribe(&mut self) -> RadioFuture<'_, mpsc::Receiver<Vec<u8>>> {
        Box::pin(async move {
            if self.radio.fail_subscribe {
                return Err(SessionError::CharacteristicNotFound("fake".into()));
            }
            let frames = &self.radio.notifications;
            let (tx, rx) = mpsc::channel(frames.len().max(1));
            for frame in frames {
                let _ = tx.try_send(frame.clone());
            }
            if self.radio.keep_link_open {
                self.held = Some(tx);
            }
            Ok(rx)
        })
    }

    fn release(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let counters = Arc::clone(&self.radio.counters);
        Box::pin(async move {
            counters.releases.fetch_add(1, Ordering::SeqCst);
            counters.open_links.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
