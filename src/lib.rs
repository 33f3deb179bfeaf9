//! Forth-79 virtual machine with fixed-point execution telemetry and a
//! two-tier block store.

/// Block-device backends
pub mod blkio;
/// Block engine: logical block space, BAM, write-back cache
pub mod blocks;
/// Dictionary entries and search order
pub mod dict;
/// Q48.16 fixed-point arithmetic
pub mod fixed;
/// Heartbeat tick telemetry
pub mod heartbeat;
/// Host services trait and implementations
pub mod host;
/// Hot-words cache and Bayesian posteriors
pub mod hotcache;
/// VM execution core
pub mod vm;
/// Forth-79 core word set
pub mod words;

pub use self::blkio::{BlockDevice, FileDevice, RamDevice};
pub use self::blocks::BlockEngine;
pub use self::dict::Dictionary;
pub use self::host::{CapturingHost, HostServices, ParityHost, StdHost};
pub use self::hotcache::HotCache;
pub use self::vm::{Cell, VAddr, Vm};
