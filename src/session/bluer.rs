//! BlueZ D-Bus transport.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. The D-Bus
//! session is opened on first use, so a daemon that is not up yet surfaces as
//! an ordinary [`SessionError::Bluetooth`] and is retried with backoff.
//!
//! Discovery and listening register an advertisement monitor for FE95 service
//! data, so only advertisements received after registration count. Devices
//! BlueZ still has cached from earlier scans are never reported as seen.

use super::{Advertisement, FRAME_CHANNEL_BUFFER_SIZE, Link, Radio, RadioFuture, SessionError};
use crate::decoder::mibeacon::MIBEACON_SERVICE_UUID16;
use crate::mac_address::MacAddress;
use bluer::gatt::remote::Characteristic;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::{Stream, StreamExt};
use log::{debug, info};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;

/// MiBeacon service data UUID (16-bit `0xFE95` on the Bluetooth base UUID).
pub const MIBEACON_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe95_0000_1000_8000_00805f9b34fb);

/// Characteristic that notifies temperature, humidity and battery frames.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xebe0ccc1_7a0a_4b0c_8a1a_6ff2997da3a6);

/// AD type "Service Data - 16-bit UUID"
pub const SERVICE_DATA_16_TYPE: u8 = 0x16;

type DeviceEvents = Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>;

/// Monitor matching advertisements that carry MiBeacon service data.
fn mibeacon_monitor() -> Monitor {
    // Service data starts with the 16-bit UUID, little-endian.
    let pattern = Pattern {
        data_type: SERVICE_DATA_16_TYPE,
        start_position: 0,
        content: MIBEACON_SERVICE_UUID16.to_le_bytes().to_vec(),
    };
    Monitor {
        patterns: Some(vec![pattern]),
        ..Default::default()
    }
}

impl From<bluer::Error> for SessionError {
    fn from(err: bluer::Error) -> Self {
        SessionError::Bluetooth(err.to_string())
    }
}

/// [`Radio`] backed by the default BlueZ adapter.
#[derive(Default)]
pub struct BluerRadio {
    bluetooth: OnceCell<(Session, Adapter)>,
}

impl BluerRadio {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter, SessionError> {
        let (_session, adapter) = self
            .bluetooth
            .get_or_try_init(|| async {
                let session = Session::new().await?;
                let adapter = session.default_adapter().await?;
                adapter.set_powered(true).await?;
                info!("Using Bluetooth adapter {}", adapter.name());
                Ok::<_, SessionError>((session, adapter))
            })
            .await?;
        Ok(adapter)
    }
}

impl Radio for BluerRadio {
    fn discover(&self, address: MacAddress) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            let adapter = self.adapter().await?;
            let target: Address = address.into();

            let monitor_manager = adapter.monitor().await?;
            let mut monitor_handle = monitor_manager.register(mibeacon_monitor()).await?;
            while let Some(event) = monitor_handle.next().await {
                if let MonitorEvent::DeviceFound(found) = event
                    && found.device == target
                {
                    return Ok(());
                }
            }
            Err(SessionError::Bluetooth("advertisement monitor stopped".to_string()))
        })
    }

    fn connect(&self, address: MacAddress) -> RadioFuture<'_, Box<dyn Link>> {
        Box::pin(async move {
            let adapter = self.adapter().await?;
            let device = adapter.device(address.into())?;
            if !device.is_connected().await? {
                device.connect().await?;
            }

            match find_characteristic(&device, NOTIFY_CHARACTERISTIC_UUID).await {
                Ok(Some(characteristic)) => {
                    let link: Box<dyn Link> = Box::new(BluerLink {
                        device,
                        characteristic,
                        forwarder: None,
                    });
                    Ok(link)
                }
                Ok(None) => {
                    disconnect(&device).await;
                    Err(SessionError::CharacteristicNotFound(
                        NOTIFY_CHARACTERISTIC_UUID.to_string(),
                    ))
                }
                Err(e) => {
                    disconnect(&device).await;
                    Err(e)
                }
            }
        })
    }

    fn abort_connect(&self, address: MacAddress) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Ok(adapter) = self.adapter().await else {
                return;
            };
            if let Ok(device) = adapter.device(address.into()) {
                disconnect(&device).await;
            }
        })
    }

    fn listen(&self, address: MacAddress) -> RadioFuture<'_, mpsc::Receiver<Advertisement>> {
        Box::pin(async move {
            let adapter = self.adapter().await?.clone();
            let target: Address = address.into();
            let monitor_manager = adapter.monitor().await?;
            let mut monitor_handle = monitor_manager.register(mibeacon_monitor()).await?;

            let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);

            // The monitor stays registered exactly as long as this task.
            tokio::spawn(async move {
                let _monitor_manager = monitor_manager;
                // Property changes of the target while the monitor tracks it
                let mut updates: Option<DeviceEvents> = None;
                let mut rssi = None;

                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        event = monitor_handle.next() => match event {
                            Some(MonitorEvent::DeviceFound(found)) if found.device == target => {
                                let device = match adapter.device(target) {
                                    Ok(device) => device,
                                    Err(e) => {
                                        debug!("{target}: {e}");
                                        continue;
                                    }
                                };
                                match advertisement(&device).await {
                                    Ok(Some(advert)) => {
                                        rssi = advert.rssi;
                                        if tx.send(advert).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => debug!("{target}: cannot read advertisement: {e}"),
                                }
                                updates = match device.events().await {
                                    Ok(events) => Some(Box::pin(events)),
                                    Err(e) => {
                                        debug!("{target}: cannot follow advertisements: {e}");
                                        None
                                    }
                                };
                            }
                            Some(MonitorEvent::DeviceLost(lost)) if lost.device == target => {
                                debug!("{target}: out of range");
                                updates = None;
                            }
                            Some(_) => {}
                            None => break,
                        },
                        event = next_event(&mut updates) => match event {
                            Some(DeviceEvent::PropertyChanged(DeviceProperty::Rssi(value))) => {
                                rssi = Some(value);
                            }
                            Some(DeviceEvent::PropertyChanged(DeviceProperty::ServiceData(mut data))) => {
                                if let Some(payload) = data.remove(&MIBEACON_SERVICE_UUID) {
                                    let advert = Advertisement {
                                        address,
                                        rssi,
                                        service_data: payload,
                                    };
                                    if tx.send(advert).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(_) => {}
                            None => updates = None,
                        },
                    }
                }
            });

            Ok(rx)
        })
    }
}

/// Connected device with its notification characteristic.
struct BluerLink {
    device: Device,
    characteristic: Characteristic,
    forwarder: Option<JoinHandle<()>>,
}

impl Link for BluerLink {
    fn subscribe(&mut self) -> RadioFuture<'_, mpsc::Receiver<Vec<u8>>> {
        Box::pin(async move {
            let notifications = self.characteristic.notify().await?;
            let device_events = self.device.events().await?;
            let address = self.device.address();

            let (tx, rx) = mpsc::channel(FRAME_CHANNEL_BUFFER_SIZE);
            let forwarder = tokio::spawn(async move {
                let mut notifications = Box::pin(notifications);
                let mut device_events = Box::pin(device_events);
                loop {
                    tokio::select! {
                        frame = notifications.next() => match frame {
                            Some(frame) => {
                                if tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        event = device_events.next() => match event {
                            Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                                debug!("{address}: link dropped by the device");
                                break;
                            }
                            Some(_) => {}
                        },
                    }
                }
            });

            self.forwarder = Some(forwarder);
            Ok(rx)
        })
    }

    fn release(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let BluerLink {
            device, forwarder, ..
        } = *self;
        Box::pin(async move {
            // Dropping the notification stream stops notifications.
            if let Some(forwarder) = forwarder {
                forwarder.abort();
            }
            disconnect(&device).await;
        })
    }
}

async fn find_characteristic(
    device: &Device,
    uuid: Uuid,
) -> Result<Option<Characteristic>, SessionError> {
    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(Some(characteristic));
            }
        }
    }
    Ok(None)
}

/// Next event of `events`, or never when there is nothing to follow.
async fn next_event(events: &mut Option<DeviceEvents>) -> Option<DeviceEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

async fn advertisement(device: &Device) -> Result<Option<Advertisement>, SessionError> {
    let Some(mut service_data) = device.service_data().await? else {
        return Ok(None);
    };
    let Some(payload) = service_data.remove(&MIBEACON_SERVICE_UUID) else {
        return Ok(None);
    };

    Ok(Some(Advertisement {
        address: device.address().into(),
        rssi: device.rssi().await?,
        service_data: payload,
    }))
}

async fn disconnect(device: &Device) {
    if let Err(e) = device.disconnect().await {
        debug!("{}: disconnect failed: {e}", device.address());
    }
}
