//! Reconciler behavior tests
//!
//! All VM interaction goes through a recording mock controller, external
//! probes are stubbed, and desired state lives in a memory store, so these
//! exercise the full event-handling logic without hardware or a hypervisor.

use agent::usb::mtp::{HostTools, MtpGuard};
use agent::{HostDevice, HotplugEvent, Reconciler, ReconcileError, VmController};
use common::{
    CoreEvent, DescriptorProbe, DeviceIdentity, DeviceStrings, EventBus, IdentityResolver,
    MemoryStore, PassthroughEntry, UsbIdDatabase,
};
use qmp::QmpError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Recording VM controller with a simulated device table.
#[derive(Default)]
struct MockVm {
    table: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    fail_attach: AtomicBool,
    fail_check: AtomicBool,
}

impl MockVm {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn adds(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("add "))
            .count()
    }

    fn dels(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("del "))
            .count()
    }

    fn insert(&self, synthetic_id: &str) {
        self.table.lock().unwrap().insert(synthetic_id.to_string());
    }
}

/// Shared handle to a [`MockVm`] that carries the [`VmController`] impl.
///
/// The reconciler must own its controller while the test keeps a handle
/// to inspect recorded calls; cloning an `Arc` bridges the two. The impl
/// lives on this newtype rather than on `Arc<MockVm>` directly because
/// orphan rules forbid implementing a foreign trait for `Arc<_>` here.
#[derive(Clone)]
struct SharedVm(Arc<MockVm>);

impl VmController for SharedVm {
    async fn has_device(&self, synthetic_id: &str) -> qmp::Result<bool> {
        if self.0.fail_check.load(Ordering::SeqCst) {
            return Err(QmpError::Timeout { timeout_ms: 1 });
        }
        Ok(self.0.table.lock().unwrap().contains(synthetic_id))
    }

    async fn attach(&self, device: &HostDevice) -> qmp::Result<()> {
        if self.0.fail_attach.load(Ordering::SeqCst) {
            return Err(QmpError::Timeout { timeout_ms: 1 });
        }
        let id = device.identity().synthetic_id();
        self.0.calls.lock().unwrap().push(format!(
            "add {} vendorid={} productid={} hostdevice={}",
            id,
            device.vendor_id,
            device.product_id,
            device.bus_path()
        ));
        self.0.insert(&id);
        Ok(())
    }

    async fn detach(&self, synthetic_id: &str) -> qmp::Result<()> {
        self.0
            .calls
            .lock()
            .unwrap()
            .push(format!("del {synthetic_id}"));
        self.0.table.lock().unwrap().remove(synthetic_id);
        Ok(())
    }
}

struct StubProbe {
    calls: Arc<AtomicUsize>,
}

impl DescriptorProbe for StubProbe {
    async fn query(&self, _identity: DeviceIdentity) -> DeviceStrings {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DeviceStrings {
            manufacturer: Some("Logitech".to_string()),
            product: Some("USB Receiver".to_string()),
        }
    }
}

struct StubTools {
    mtp_claimed: bool,
    dump_calls: Arc<AtomicUsize>,
    releases: Arc<Mutex<Vec<String>>>,
}

impl HostTools for StubTools {
    async fn verbose_descriptor_dump(&self, _identity: DeviceIdentity) -> Option<String> {
        self.dump_calls.fetch_add(1, Ordering::SeqCst);
        Some(if self.mtp_claimed {
            "iInterface 5 MTP".to_string()
        } else {
            "iInterface 0".to_string()
        })
    }

    async fn release_bus_device(&self, bus_path: &str) -> bool {
        self.releases.lock().unwrap().push(bus_path.to_string());
        true
    }
}

struct Fixture {
    vm: Arc<MockVm>,
    probe_calls: Arc<AtomicUsize>,
    dump_calls: Arc<AtomicUsize>,
    releases: Arc<Mutex<Vec<String>>>,
    events: EventBus,
    reconciler: Reconciler<SharedVm, StubProbe, StubTools, MemoryStore>,
}

fn fixture(desired: Vec<PassthroughEntry>, mtp_claimed: bool) -> Fixture {
    let vm = Arc::new(MockVm::default());
    let probe_calls = Arc::new(AtomicUsize::new(0));
    let dump_calls = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(Mutex::new(Vec::new()));
    let events = EventBus::new();

    let reconciler = Reconciler::new(
        SharedVm(vm.clone()),
        IdentityResolver::new(
            UsbIdDatabase::default(),
            StubProbe {
                calls: probe_calls.clone(),
            },
        ),
        MtpGuard::new(StubTools {
            mtp_claimed,
            dump_calls: dump_calls.clone(),
            releases: releases.clone(),
        }),
        MemoryStore::new(desired),
        events.clone(),
    );

    Fixture {
        vm,
        probe_calls,
        dump_calls,
        releases,
        events,
        reconciler,
    }
}

fn receiver() -> HostDevice {
    HostDevice {
        vendor_id: 0x046d,
        product_id: 0xc52b,
        bus_number: 3,
        address: 7,
    }
}

fn receiver_entry() -> PassthroughEntry {
    PassthroughEntry {
        vendor_id: 0x046d,
        product_id: 0xc52b,
        manufacturer: Some("Logitech".to_string()),
        product: Some("USB Receiver".to_string()),
    }
}

/// The end-to-end scenario: desired + connected device, VM comes up,
/// exactly one add; detach, exactly one del; reattach with the id still
/// in the table short-circuits.
#[tokio::test]
async fn reachable_transition_attach_detach_scenario() {
    let mut f = fixture(vec![receiver_entry()], false);
    f.reconciler.prime(vec![receiver()]).await;

    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(
        f.vm.calls(),
        vec![
            "add 1133:50475 vendorid=1133 productid=50475 hostdevice=/dev/bus/usb/003/007"
                .to_string()
        ]
    );

    f.reconciler
        .on_hotplug(HotplugEvent::Detached(receiver()), vec![])
        .await;
    assert_eq!(f.vm.dels(), 1);
    assert_eq!(f.vm.calls()[1], "del 1133:50475");

    // Reattach while the table (as the reconciler will observe it) already
    // holds the id: the existence check short-circuits the add.
    f.vm.insert("1133:50475");
    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;
    assert_eq!(f.vm.adds(), 1);
}

#[tokio::test]
async fn attach_event_ignores_undesired_devices() {
    let mut f = fixture(vec![], false);
    f.reconciler.on_reachability_changed(true).await;

    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;

    assert_eq!(f.vm.adds(), 0);
    // The device still got stringified (and cached) on the way through.
    assert_eq!(f.probe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nothing_happens_while_unreachable() {
    let mut f = fixture(vec![receiver_entry()], false);

    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;
    f.reconciler
        .on_hotplug(HotplugEvent::Detached(receiver()), vec![])
        .await;

    assert!(f.vm.calls().is_empty());
}

#[tokio::test]
async fn bulk_sync_skips_disconnected_and_present_entries() {
    let connected_absent = receiver_entry();
    let disconnected = PassthroughEntry {
        vendor_id: 0x05ac,
        product_id: 0x12a8,
        manufacturer: None,
        product: None,
    };
    let connected_present = PassthroughEntry {
        vendor_id: 0x04e8,
        product_id: 0x6860,
        manufacturer: None,
        product: None,
    };
    let present_device = HostDevice {
        vendor_id: 0x04e8,
        product_id: 0x6860,
        bus_number: 1,
        address: 9,
    };

    let mut f = fixture(
        vec![connected_absent, disconnected, connected_present],
        false,
    );
    f.vm.insert("1256:26720");
    f.reconciler
        .prime(vec![receiver(), present_device])
        .await;

    f.reconciler.on_reachability_changed(true).await;

    // Only the connected-but-absent entry triggers an add.
    assert_eq!(f.vm.adds(), 1);
    assert!(f.vm.calls()[0].starts_with("add 1133:50475"));
}

#[tokio::test]
async fn duplicate_add_is_rejected_and_list_unchanged() {
    let mut f = fixture(vec![], false);
    f.reconciler.prime(vec![receiver()]).await;

    f.reconciler.add_to_passthrough(receiver()).await.unwrap();
    assert_eq!(f.reconciler.desired().len(), 1);

    let err = f.reconciler.add_to_passthrough(receiver()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Duplicate(_)));
    assert_eq!(f.reconciler.desired().len(), 1);
}

#[tokio::test]
async fn add_requires_a_cached_identity() {
    let mut f = fixture(vec![], false);

    // Never primed, never seen in an attach event.
    let err = f.reconciler.add_to_passthrough(receiver()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::IdentityNotResolved(_)));
    assert!(f.reconciler.desired().is_empty());
}

#[tokio::test]
async fn add_attaches_immediately_when_reachable() {
    let mut f = fixture(vec![], false);
    f.reconciler.prime(vec![receiver()]).await;
    f.reconciler.on_reachability_changed(true).await;

    f.reconciler.add_to_passthrough(receiver()).await.unwrap();

    assert_eq!(f.vm.adds(), 1);
    assert_eq!(f.reconciler.desired(), &[receiver_entry()]);
}

#[tokio::test]
async fn remove_of_absent_entry_is_a_noop() {
    let mut f = fixture(vec![receiver_entry()], false);
    f.reconciler.on_reachability_changed(true).await;
    let before = f.vm.calls().len();

    f.reconciler
        .remove_from_passthrough(DeviceIdentity::new(0xdead, 0xbeef))
        .await
        .unwrap();

    assert_eq!(f.reconciler.desired().len(), 1);
    assert_eq!(f.vm.calls().len(), before);
}

#[tokio::test]
async fn remove_detaches_attached_device() {
    let mut f = fixture(vec![receiver_entry()], false);
    f.reconciler.prime(vec![receiver()]).await;
    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(f.vm.adds(), 1);

    f.reconciler
        .remove_from_passthrough(receiver().identity())
        .await
        .unwrap();

    assert_eq!(f.vm.dels(), 1);
    assert!(f.reconciler.desired().is_empty());
}

#[tokio::test]
async fn remove_all_clears_list_and_detaches() {
    let other = HostDevice {
        vendor_id: 0x04e8,
        product_id: 0x6860,
        bus_number: 1,
        address: 9,
    };
    let other_entry = PassthroughEntry {
        vendor_id: 0x04e8,
        product_id: 0x6860,
        manufacturer: None,
        product: None,
    };

    let mut f = fixture(vec![receiver_entry(), other_entry], false);
    f.reconciler.prime(vec![receiver(), other]).await;
    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(f.vm.adds(), 2);

    f.reconciler.remove_all().await.unwrap();

    assert_eq!(f.vm.dels(), 2);
    assert!(f.reconciler.desired().is_empty());
}

#[tokio::test]
async fn detach_invalidates_conflicting_driver_cache() {
    let mut f = fixture(vec![receiver_entry()], true);
    f.reconciler.prime(vec![receiver()]).await;

    // First attach probes the claim once and releases the bus node.
    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(f.dump_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        f.releases.lock().unwrap().as_slice(),
        &["/dev/bus/usb/003/007".to_string()]
    );

    // Detach must drop the cached claim state...
    f.reconciler
        .on_hotplug(HotplugEvent::Detached(receiver()), vec![])
        .await;

    // ...so the next attach re-probes instead of trusting a stale entry.
    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;
    assert_eq!(f.dump_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_attach_keeps_entry_desired_and_retries() {
    let mut f = fixture(vec![receiver_entry()], false);
    f.reconciler.prime(vec![receiver()]).await;

    f.vm.fail_attach.store(true, Ordering::SeqCst);
    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(f.vm.adds(), 0);
    // No rollback: the entry is still desired.
    assert_eq!(f.reconciler.desired().len(), 1);

    // The next reachability transition retries and succeeds.
    f.vm.fail_attach.store(false, Ordering::SeqCst);
    f.reconciler.on_reachability_changed(false).await;
    f.reconciler.on_reachability_changed(true).await;
    assert_eq!(f.vm.adds(), 1);
}

#[tokio::test]
async fn failed_existence_check_never_duplicates_an_add() {
    let mut f = fixture(vec![receiver_entry()], false);
    f.reconciler.prime(vec![receiver()]).await;

    f.vm.fail_check.store(true, Ordering::SeqCst);
    f.reconciler.on_reachability_changed(true).await;
    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;

    // With the table unreadable, the reconciler must not guess.
    assert_eq!(f.vm.adds(), 0);
}

#[tokio::test]
async fn events_are_emitted_on_transitions() {
    let mut f = fixture(vec![], false);
    let mut rx = f.events.subscribe();

    f.reconciler
        .on_hotplug(HotplugEvent::Attached(receiver()), vec![receiver()])
        .await;
    f.reconciler.on_reachability_changed(true).await;
    f.reconciler.add_to_passthrough(receiver()).await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), CoreEvent::DeviceListChanged);
    assert_eq!(
        rx.recv().await.unwrap(),
        CoreEvent::ReachabilityChanged { reachable: true }
    );
    assert_eq!(rx.recv().await.unwrap(), CoreEvent::PassthroughTableChanged);
}

#[tokio::test]
async fn is_connected_matches_identity_only() {
    let mut f = fixture(vec![receiver_entry()], false);
    // Same identity at a different bus location still counts as connected.
    let moved = HostDevice {
        bus_number: 1,
        address: 2,
        ..receiver()
    };
    f.reconciler.prime(vec![moved]).await;

    assert!(f.reconciler.is_connected(&receiver_entry()));
    assert!(!f.reconciler.is_connected(&PassthroughEntry {
        vendor_id: 0xdead,
        product_id: 0xbeef,
        manufacturer: None,
        product: None,
    }));
}
