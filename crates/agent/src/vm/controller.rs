//! VM device-table mutations
//!
//! [`VmController`] is the reconciler's only way to touch the VM: existence
//! check, attach, detach. The production implementation drives the QMP
//! client; tests substitute a recording mock.

use crate::usb::HostDevice;
use crate::vm::table::TableQuery;
use qmp::{DeviceAddArgs, QmpClient};
use tracing::debug;

pub trait VmController: Send {
    /// Whether the VM device table contains `synthetic_id`.
    fn has_device(&self, synthetic_id: &str) -> impl Future<Output = qmp::Result<bool>> + Send;

    /// Hot-add `device` to the VM, keyed by its synthetic id.
    fn attach(&self, device: &HostDevice) -> impl Future<Output = qmp::Result<()>> + Send;

    /// Remove the device with `synthetic_id` from the VM.
    fn detach(&self, synthetic_id: &str) -> impl Future<Output = qmp::Result<()>> + Send;
}

/// QMP-backed controller.
pub struct QmpVmController {
    client: QmpClient,
    table: TableQuery,
}

impl QmpVmController {
    /// Wrap a ready client, probing once for the device-table query the
    /// hypervisor supports.
    pub async fn new(client: QmpClient) -> Self {
        let table = TableQuery::detect(&client).await;
        Self { client, table }
    }

    pub fn client(&self) -> &QmpClient {
        &self.client
    }
}

impl VmController for QmpVmController {
    async fn has_device(&self, synthetic_id: &str) -> qmp::Result<bool> {
        self.table.contains(&self.client, synthetic_id).await
    }

    async fn attach(&self, device: &HostDevice) -> qmp::Result<()> {
        let args = DeviceAddArgs::usb_host(
            device.identity().synthetic_id(),
            device.vendor_id,
            device.product_id,
            device.bus_path(),
        );
        let response = self.client.device_add(args).await?;
        debug!(?response, "device_add accepted");
        Ok(())
    }

    async fn detach(&self, synthetic_id: &str) -> qmp::Result<()> {
        let response = self.client.device_del(synthetic_id).await?;
        debug!(?response, "device_del accepted");
        Ok(())
    }
}
