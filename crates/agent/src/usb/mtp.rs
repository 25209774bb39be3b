//! Conflicting host-driver handling
//!
//! Phones and cameras are often claimed by a host MTP stack the moment they
//! enumerate, which blocks the hypervisor from taking exclusive ownership.
//! Detection scrapes the verbose descriptor dump for an MTP marker; release
//! kills whatever holds the device's bus node open. Both are soft
//! operations: a missing tool degrades to "not claimed" / "not released".
//!
//! Claim results are cached per identity and invalidated on detach, since
//! the claim state can differ after a replug.

use super::hotplug::HostDevice;
use common::DeviceIdentity;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// External host-side probes and actions, as a seam for tests.
pub trait HostTools: Send {
    /// Verbose descriptor dump for the device, or `None` if the tool is
    /// unavailable or the device is gone.
    fn verbose_descriptor_dump(
        &self,
        identity: DeviceIdentity,
    ) -> impl Future<Output = Option<String>> + Send;

    /// Kill whichever process holds the bus node open. Returns whether the
    /// command ran at all (not whether anything was holding the node).
    fn release_bus_device(&self, bus_path: &str) -> impl Future<Output = bool> + Send;
}

/// Production tools: `lsusb -v -d` and `fuser -k`.
pub struct SystemTools;

impl HostTools for SystemTools {
    async fn verbose_descriptor_dump(&self, identity: DeviceIdentity) -> Option<String> {
        let output = Command::new("lsusb")
            .arg("-v")
            .arg("-d")
            .arg(identity.hex_key())
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(err) => {
                warn!(device = %identity, %err, "verbose descriptor dump failed");
                None
            }
        }
    }

    async fn release_bus_device(&self, bus_path: &str) -> bool {
        match Command::new("fuser").arg("-k").arg(bus_path).output().await {
            Ok(_) => true,
            Err(err) => {
                warn!(bus_path, %err, "forced release failed to run");
                false
            }
        }
    }
}

const MTP_MARKER: &str = "MTP";

/// Cached conflicting-driver detection plus the forced-release step.
pub struct MtpGuard<T> {
    tools: T,
    cache: HashMap<String, bool>,
}

impl<T: HostTools> MtpGuard<T> {
    pub fn new(tools: T) -> Self {
        Self {
            tools,
            cache: HashMap::new(),
        }
    }

    /// Whether the device is claimed by an MTP stack, probing on first
    /// check per identity.
    pub async fn is_claimed(&mut self, identity: DeviceIdentity) -> bool {
        let key = identity.hex_key();
        if let Some(&claimed) = self.cache.get(&key) {
            return claimed;
        }

        let claimed = match self.tools.verbose_descriptor_dump(identity).await {
            Some(dump) => dump.contains(MTP_MARKER),
            None => false,
        };
        debug!(device = %identity, claimed, "conflicting-driver check");
        self.cache.insert(key, claimed);
        claimed
    }

    /// Drop the cached claim state; the next check re-probes.
    pub fn invalidate(&mut self, identity: DeviceIdentity) {
        self.cache.remove(&identity.hex_key());
    }

    /// Release the device's bus node if (and only if) it is claimed.
    pub async fn release_if_claimed(&mut self, device: &HostDevice) {
        if !self.is_claimed(device.identity()).await {
            return;
        }
        let bus_path = device.bus_path();
        if self.tools.release_bus_device(&bus_path).await {
            info!(%bus_path, "released conflicting driver claim");
        } else {
            info!(%bus_path, "device did not need releasing or could not be released");
        }
    }
}
