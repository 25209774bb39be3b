//! Passthrough reconciler
//!
//! Converges the VM's passed-through device set with the persisted desired
//! list. Inputs: host attach/detach events, VM reachability transitions,
//! and user-initiated desired-list mutations. The desired list says what
//! should be attached, the live host list what can be, and the VM device
//! table (queried through the controller) what currently is.
//!
//! One owner drives all of this to completion, one event at a time; that
//! serialization is what keeps the single-outstanding-command QMP session
//! safe. Event handlers never propagate errors: a failed VM call is
//! logged and the entry stays desired, to be retried on the next
//! reachability transition.

use crate::usb::mtp::{HostTools, MtpGuard};
use crate::usb::{HostDevice, HotplugEvent};
use crate::vm::VmController;
use common::{
    CoreEvent, DescriptorProbe, DesiredStateStore, DeviceIdentity, EventBus, IdentityResolver,
    PassthroughEntry,
};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired list already holds this `(vendor, product)` pair.
    #[error("device {0} is already in the passthrough list")]
    Duplicate(String),

    /// The device was never stringified, so no identity strings exist to
    /// persist.
    #[error("device {0} has not been identified yet")]
    IdentityNotResolved(DeviceIdentity),

    #[error(transparent)]
    Store(#[from] common::Error),

    #[error(transparent)]
    Vm(#[from] qmp::QmpError),
}

/// The reconciliation engine.
///
/// Explicitly constructed from its collaborators so tests can instantiate
/// independent instances; nothing here is process-global.
pub struct Reconciler<C, P, T, S> {
    controller: C,
    resolver: IdentityResolver<P>,
    mtp: MtpGuard<T>,
    store: S,
    events: EventBus,
    devices: Vec<HostDevice>,
    reachable: bool,
}

impl<C, P, T, S> Reconciler<C, P, T, S>
where
    C: VmController,
    P: DescriptorProbe,
    T: HostTools,
    S: DesiredStateStore,
{
    pub fn new(
        controller: C,
        resolver: IdentityResolver<P>,
        mtp: MtpGuard<T>,
        store: S,
        events: EventBus,
    ) -> Self {
        Self {
            controller,
            resolver,
            mtp,
            store,
            events,
            devices: Vec::new(),
            reachable: false,
        }
    }

    /// Record the initial device list and stringify every device on it.
    ///
    /// Pre-caching matters: a detach event arrives after the device is
    /// gone, and for database-absent devices the descriptor query only
    /// works while they are still connected.
    pub async fn prime(&mut self, devices: Vec<HostDevice>) {
        for device in &devices {
            let described = self.resolver.stringify(device.identity()).await;
            debug!(device = %described, "primed device identity");
        }
        self.devices = devices;
    }

    pub fn devices(&self) -> &[HostDevice] {
        &self.devices
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// The current desired passthrough list.
    pub fn desired(&self) -> &[PassthroughEntry] {
        self.store.entries()
    }

    /// True iff some currently enumerated device matches the entry.
    pub fn is_connected(&self, entry: &PassthroughEntry) -> bool {
        self.find_live(entry.identity()).is_some()
    }

    /// Dispatch one hot-plug event with a fresh device snapshot.
    pub async fn on_hotplug(&mut self, event: HotplugEvent, live: Vec<HostDevice>) {
        match event {
            HotplugEvent::Attached(device) => self.on_device_attached(device, live).await,
            HotplugEvent::Detached(device) => self.on_device_detached(device, live).await,
        }
    }

    /// Host attach: cache identity, then attach to the VM when the device
    /// is desired, the VM is reachable, and the table does not have it yet.
    pub async fn on_device_attached(&mut self, device: HostDevice, live: Vec<HostDevice>) {
        self.devices = live;
        self.events.emit(CoreEvent::DeviceListChanged);

        let described = self.resolver.stringify(device.identity()).await;
        info!(device = %described, "USB device attached");

        if !self.reachable || !self.desired_contains(device.identity()) {
            return;
        }

        let synthetic_id = device.identity().synthetic_id();
        match self.controller.has_device(&synthetic_id).await {
            Ok(true) => {
                debug!(device = %described, "already in VM device table");
            }
            Ok(false) => {
                info!(device = %described, "device is in passthrough list, adding to VM");
                if let Err(err) = self.attach_device(device).await {
                    error!(device = %described, %err, "failed to add device to VM");
                }
            }
            Err(err) => {
                error!(device = %described, %err, "device-table check failed, skipping add");
            }
        }
    }

    /// Host detach: invalidate the conflicting-driver cache, then remove
    /// from the VM when the device was desired and present.
    pub async fn on_device_detached(&mut self, device: HostDevice, live: Vec<HostDevice>) {
        self.devices = live;
        self.events.emit(CoreEvent::DeviceListChanged);

        let identity = device.identity();
        self.mtp.invalidate(identity);

        let described = self.resolver.stringify(identity).await;
        info!(device = %described, "USB device detached");

        if !self.reachable || !self.desired_contains(identity) {
            return;
        }

        let synthetic_id = identity.synthetic_id();
        match self.controller.has_device(&synthetic_id).await {
            Ok(true) => {
                info!(device = %described, "device is in passthrough list, removing from VM");
                if let Err(err) = self.controller.detach(&synthetic_id).await {
                    error!(device = %described, %err, "failed to remove device from VM");
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!(device = %described, %err, "device-table check failed, skipping remove");
            }
        }
    }

    /// Reachability edge. On the rising edge, bulk catch-up: attach every
    /// desired, connected, not-yet-present device.
    pub async fn on_reachability_changed(&mut self, reachable: bool) {
        self.reachable = reachable;
        self.events.emit(CoreEvent::ReachabilityChanged { reachable });

        if !reachable {
            info!("VM unreachable, suspending passthrough");
            return;
        }

        info!("VM reachable, passing through desired devices");
        for entry in self.store.entries().to_vec() {
            if !self.is_connected(&entry) {
                continue;
            }
            let synthetic_id = entry.identity().synthetic_id();
            match self.controller.has_device(&synthetic_id).await {
                Ok(true) => {}
                Ok(false) => {
                    let Some(device) = self.find_live(entry.identity()) else {
                        continue;
                    };
                    info!(device = %entry.describe(), "desired device connected, adding to VM");
                    if let Err(err) = self.attach_device(device).await {
                        error!(device = %entry.describe(), %err, "failed to add device to VM");
                    }
                }
                Err(err) => {
                    error!(device = %entry.describe(), %err, "device-table check failed during sync");
                }
            }
        }
    }

    /// Add a connected device to the desired list, attaching immediately
    /// when possible.
    ///
    /// Rejects duplicates of the same `(vendor, product)` pair. Requires
    /// the device to have been stringified at least once (prime or an
    /// attach event both establish this).
    pub async fn add_to_passthrough(&mut self, device: HostDevice) -> Result<(), ReconcileError> {
        let identity = device.identity();
        let strings = self
            .resolver
            .cached(identity)
            .cloned()
            .ok_or(ReconcileError::IdentityNotResolved(identity))?;

        let entry = PassthroughEntry::new(identity, strings);
        if self.desired_contains(identity) {
            return Err(ReconcileError::Duplicate(entry.describe()));
        }

        let mut entries = self.store.entries().to_vec();
        entries.push(entry.clone());
        self.store.replace(entries)?;
        self.events.emit(CoreEvent::PassthroughTableChanged);
        info!(device = %entry.describe(), "added device to passthrough list");

        if self.reachable {
            let synthetic_id = identity.synthetic_id();
            match self.controller.has_device(&synthetic_id).await {
                Ok(false) => {
                    // A failed attach leaves the entry desired; the next
                    // reachability transition retries it.
                    if let Err(err) = self.attach_device(device).await {
                        error!(device = %entry.describe(), %err, "failed to add device to VM");
                    }
                }
                Ok(true) => {}
                Err(err) => {
                    error!(device = %entry.describe(), %err, "device-table check failed after add");
                }
            }
        }

        Ok(())
    }

    /// Remove an entry from the desired list, detaching it from the VM if
    /// currently attached. Removing an absent entry is a no-op.
    pub async fn remove_from_passthrough(
        &mut self,
        identity: DeviceIdentity,
    ) -> Result<(), ReconcileError> {
        let entries = self.store.entries().to_vec();
        let remaining: Vec<PassthroughEntry> = entries
            .iter()
            .filter(|entry| entry.identity() != identity)
            .cloned()
            .collect();
        if remaining.len() == entries.len() {
            debug!(device = %identity, "remove of absent entry ignored");
            return Ok(());
        }

        self.store.replace(remaining)?;
        self.events.emit(CoreEvent::PassthroughTableChanged);
        info!(device = %identity, "removed device from passthrough list");

        if self.reachable {
            let synthetic_id = identity.synthetic_id();
            match self.controller.has_device(&synthetic_id).await {
                Ok(true) => {
                    if let Err(err) = self.controller.detach(&synthetic_id).await {
                        error!(device = %identity, %err, "failed to remove device from VM");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    error!(device = %identity, %err, "device-table check failed after remove");
                }
            }
        }

        Ok(())
    }

    /// Remove every desired entry, then clear the persisted list.
    pub async fn remove_all(&mut self) -> Result<(), ReconcileError> {
        for entry in self.store.entries().to_vec() {
            self.remove_from_passthrough(entry.identity()).await?;
        }
        self.store.replace(Vec::new())?;
        Ok(())
    }

    fn desired_contains(&self, identity: DeviceIdentity) -> bool {
        self.store
            .entries()
            .iter()
            .any(|entry| entry.identity() == identity)
    }

    /// First live device matching the identity. With two identical
    /// `(vendor, product)` devices connected, the first enumerated one
    /// wins; the pair is indistinguishable by design.
    fn find_live(&self, identity: DeviceIdentity) -> Option<HostDevice> {
        self.devices
            .iter()
            .copied()
            .find(|device| device.identity() == identity)
    }

    async fn attach_device(&mut self, device: HostDevice) -> Result<(), ReconcileError> {
        self.mtp.release_if_claimed(&device).await;
        self.controller.attach(&device).await?;
        info!(
            device = %device.identity(),
            hostdevice = %device.bus_path(),
            "added device to VM"
        );
        Ok(())
    }
}
