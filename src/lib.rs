//! ringlink - Shared-memory ring transport between a datapath and its control peer
//!
//! A packet-processing datapath and an out-of-process control peer exchange
//! control messages and packets through named shared-memory rings. Rings
//! carry only buffer handles; payloads live in a shared buffer pool, so a
//! message crosses the process boundary without being copied.
//!
//! # Architecture
//!
//! - **Datapath**: creates the buffer pool and the tx, rx and packet rings
//! - **Control peer** ([`Transport`]): attaches by name, sends request bursts
//!   on tx, waits for replies on rx, polls upcalled packets
//! - **KNI provisioning** ([`KniProvisioner`]): seven fifos per kernel port
//!
//! Regions are created and found through a [`RegionRegistry`]:
//! [`PosixRegistry`] for cross-process use, [`LocalRegistry`] in-process.

pub mod error;
pub mod shm;
pub mod registry;
pub mod names;
pub mod wait;
pub mod ring;
pub mod pool;
pub mod message;
pub mod transport;
pub mod datapath;
pub mod kni;
pub mod bindings;

pub use error::{LinkError, Result};
pub use registry::{LocalRegistry, PosixRegistry, RegionRegistry};
pub use ring::{Ring, RingConsumer, RingProducer};
pub use pool::{BufHandle, BufferPool, TransferBuf};
pub use message::{Family, MessageHeader, Request, Upcall, UpcallInfo};
pub use transport::{LinkConfig, Transport, MAX_BURST};
pub use datapath::Datapath;
pub use kni::{KniConfig, KniProvisioner, PortBundle, ProvisionReport, QueueRole};
pub use wait::{CancelToken, WaitPolicy};
