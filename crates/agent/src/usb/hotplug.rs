//! Host USB device watcher
//!
//! Enumerates connected devices and forwards hot-plug events from libusb.
//! libusb delivers callbacks only while some thread pumps its event loop,
//! so the watcher owns a dedicated `usb-watcher` OS thread and bridges
//! events into the async world over an `async-channel`.

use common::DeviceIdentity;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// A USB device as observed on the host.
///
/// Identity for passthrough purposes is `(vendor_id, product_id)`; bus and
/// address only locate the device node handed to the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
}

impl HostDevice {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// The `/dev/bus/usb/BBB/DDD` node for this device.
    pub fn bus_path(&self) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", self.bus_number, self.address)
    }
}

#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Attached(HostDevice),
    Detached(HostDevice),
}

/// Watches the host USB bus for attach/detach events.
pub struct DeviceWatcher {
    context: Context,
    event_rx: async_channel::Receiver<HotplugEvent>,
    stop: Arc<AtomicBool>,
    _registration: Registration<Context>,
    _pump: std::thread::JoinHandle<()>,
}

impl DeviceWatcher {
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (event_tx, event_rx) = async_channel::bounded(64);

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(EventForwarder { event_tx }))?;

        let stop = Arc::new(AtomicBool::new(false));
        let pump_context = context.clone();
        let pump_stop = stop.clone();
        let pump = std::thread::Builder::new()
            .name("usb-watcher".to_string())
            .spawn(move || {
                while !pump_stop.load(Ordering::Relaxed) {
                    match pump_context.handle_events(Some(Duration::from_millis(100))) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(err) => {
                            warn!(%err, "error handling USB events");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })
            .expect("failed to spawn usb-watcher thread");

        Ok(Self {
            context,
            event_rx,
            stop,
            _registration: registration,
            _pump: pump,
        })
    }

    /// Enumerate the devices currently on the bus.
    ///
    /// Devices whose descriptor cannot be read are skipped with a warning.
    pub fn snapshot(&self) -> Result<Vec<HostDevice>, rusb::Error> {
        let mut devices = Vec::new();
        for device in self.context.devices()?.iter() {
            match host_device(&device) {
                Some(host) => devices.push(host),
                None => warn!(
                    bus = device.bus_number(),
                    address = device.address(),
                    "skipping device with unreadable descriptor"
                ),
            }
        }
        Ok(devices)
    }

    /// Next hot-plug event, in OS delivery order.
    pub async fn next_event(&self) -> common::Result<HotplugEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| common::Error::Channel(e.to_string()))
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn host_device<T: UsbContext>(device: &Device<T>) -> Option<HostDevice> {
    let descriptor = device.device_descriptor().ok()?;
    Some(HostDevice {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        address: device.address(),
    })
}

/// Forwards libusb callbacks onto the event channel.
///
/// Runs on the usb-watcher thread; `send_blocking` applies backpressure if
/// the reconciler falls behind.
struct EventForwarder {
    event_tx: async_channel::Sender<HotplugEvent>,
}

impl<T: UsbContext> Hotplug<T> for EventForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let Some(host) = host_device(&device) else {
            warn!(
                bus = device.bus_number(),
                address = device.address(),
                "arrived device has unreadable descriptor"
            );
            return;
        };
        if let Err(err) = self.event_tx.send_blocking(HotplugEvent::Attached(host)) {
            warn!(%err, "failed to forward attach event");
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let Some(host) = host_device(&device) else {
            warn!(
                bus = device.bus_number(),
                address = device.address(),
                "departed device has unreadable descriptor"
            );
            return;
        };
        if let Err(err) = self.event_tx.send_blocking(HotplugEvent::Detached(host)) {
            warn!(%err, "failed to forward detach event");
        }
    }
}
