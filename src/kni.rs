//! Per-port fifo provisioning for kernel network interfaces
//!
//! Every KNI port talks to its kernel peer over seven rings. The
//! [`KniProvisioner`] creates them under deterministic names
//! (`kni_port_<id>_<role>`) so an out-of-process peer can attach by name.

use crate::error::{LinkError, Result};
use crate::names::kni_queue_name;
use crate::registry::RegionRegistry;
use crate::ring::{Ring, SLOT_SIZE};
use std::collections::BTreeMap;
use std::fmt;

/// Upper bound on provisioned ports
pub const MAX_KNI_PORTS: u16 = 32;

/// Slot count of every KNI fifo
pub const KNI_FIFO_COUNT_MAX: u32 = 1024;

/// Purpose of one ring in a port's bundle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Tx,
    Rx,
    Alloc,
    Free,
    Req,
    Resp,
    Sync,
}

impl QueueRole {
    /// Creation order within a bundle
    pub const ALL: [QueueRole; 7] = [
        QueueRole::Tx,
        QueueRole::Rx,
        QueueRole::Alloc,
        QueueRole::Free,
        QueueRole::Req,
        QueueRole::Resp,
        QueueRole::Sync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueRole::Tx => "tx",
            QueueRole::Rx => "rx",
            QueueRole::Alloc => "alloc",
            QueueRole::Free => "free",
            QueueRole::Req => "req",
            QueueRole::Resp => "resp",
            QueueRole::Sync => "sync",
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct KniConfig {
    /// Ports `0..max_ports` are provisioned
    pub max_ports: u16,
    /// Slot count of each fifo (power of two)
    pub fifo_count: u32,
}

impl Default for KniConfig {
    fn default() -> Self {
        Self {
            max_ports: MAX_KNI_PORTS,
            fifo_count: KNI_FIFO_COUNT_MAX,
        }
    }
}

/// The seven rings of one port
pub struct PortBundle {
    port_id: u16,
    tx: Ring,
    rx: Ring,
    alloc: Ring,
    free: Ring,
    req: Ring,
    resp: Ring,
    sync: Ring,
}

impl PortBundle {
    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    pub fn queue(&self, role: QueueRole) -> &Ring {
        match role {
            QueueRole::Tx => &self.tx,
            QueueRole::Rx => &self.rx,
            QueueRole::Alloc => &self.alloc,
            QueueRole::Free => &self.free,
            QueueRole::Req => &self.req,
            QueueRole::Resp => &self.resp,
            QueueRole::Sync => &self.sync,
        }
    }
}

impl fmt::Debug for PortBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortBundle")
            .field("port_id", &self.port_id)
            .field("fifo_count", &self.tx.capacity())
            .finish()
    }
}

/// Outcome of [`KniProvisioner::provision_all`], keyed by port id
#[derive(Debug, Default)]
pub struct ProvisionReport {
    ports: BTreeMap<u16, Result<PortBundle>>,
}

impl ProvisionReport {
    /// True when every port got its full bundle
    pub fn is_complete(&self) -> bool {
        self.ports.values().all(Result::is_ok)
    }

    pub fn bundle(&self, port_id: u16) -> Option<&PortBundle> {
        self.ports.get(&port_id).and_then(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (u16, &LinkError)> + '_ {
        self.ports
            .iter()
            .filter_map(|(&port, r)| r.as_ref().err().map(|e| (port, e)))
    }

    pub fn ready_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(&port, _)| port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Take ownership of the successful bundles
    pub fn into_bundles(self) -> Vec<PortBundle> {
        self.ports.into_values().filter_map(|r| r.ok()).collect()
    }
}

pub struct KniProvisioner<'r> {
    registry: &'r dyn RegionRegistry,
    config: KniConfig,
}

impl<'r> KniProvisioner<'r> {
    pub fn new(registry: &'r dyn RegionRegistry, config: KniConfig) -> Result<Self> {
        if !config.fifo_count.is_power_of_two() {
            return Err(LinkError::Config(format!(
                "kni fifo count {} is not a power of two",
                config.fifo_count
            )));
        }
        Ok(Self { registry, config })
    }

    pub fn config(&self) -> &KniConfig {
        &self.config
    }

    /// Create all seven rings of `port_id`.
    ///
    /// Either the whole bundle exists afterwards or none of it: rings built
    /// before a failure are dropped, which releases their regions.
    #[tracing::instrument(skip(self))]
    pub fn provision(&self, port_id: u16) -> Result<PortBundle> {
        if port_id >= self.config.max_ports {
            return Err(LinkError::InvalidArgument(format!(
                "port {port_id} outside 0..{}",
                self.config.max_ports
            )));
        }

        let create = |role: QueueRole| {
            let name = kni_queue_name(port_id, role.as_str());
            Ring::create(self.registry, &name, self.config.fifo_count, SLOT_SIZE).map_err(|e| {
                tracing::error!(ring = %name, error = %e, "cannot create kni fifo");
                e
            })
        };

        Ok(PortBundle {
            port_id,
            tx: create(QueueRole::Tx)?,
            rx: create(QueueRole::Rx)?,
            alloc: create(QueueRole::Alloc)?,
            free: create(QueueRole::Free)?,
            req: create(QueueRole::Req)?,
            resp: create(QueueRole::Resp)?,
            sync: create(QueueRole::Sync)?,
        })
    }

    /// Provision ports `0..max_ports`, continuing past individual failures
    pub fn provision_all(&self) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        for port_id in 0..self.config.max_ports {
            let outcome = self.provision(port_id);
            match &outcome {
                Ok(_) => tracing::info!(port_id, "kni port provisioned"),
                Err(e) => tracing::warn!(port_id, error = %e, "kni port unavailable"),
            }
            report.ports.insert(port_id, outcome);
        }

        let failed = report.failures().count();
        if failed > 0 {
            tracing::error!(failed, total = report.len(), "kni provisioning incomplete");
        }
        report
    }
}
