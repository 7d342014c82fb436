//! Sharded device-execution backend for tensor-compiler runtimes.
//!
//! The entry point is the [`Client`], which owns a device registry derived from driver enumeration and dispatches
//! tensor transfers, compilations, and replicated executions against it. Tensors live on devices as reference
//! counted [`DataHandle`]s, optionally sharded across the device set under a [`ShardingSpec`] and addressed
//! through the replicated virtual device; computations are built as [`Graph`]s, compiled into [`Computation`]s,
//! and executed once across all participating devices per step. Device-side work is asynchronous behind a
//! synchronous API: per-device submission order is preserved, in-flight operations are tracked per device, and
//! [`Client::wait_device_ops`] is the only cross-operation synchronization point.

pub mod clients;
pub mod data;
pub mod devices;
pub mod distributed;
pub mod driver;
pub mod errors;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod operations;
pub mod programs;
pub mod sharding;
pub mod transfers;
pub mod values;

pub use clients::*;
pub use data::*;
pub use devices::*;
pub use distributed::*;
pub use driver::*;
pub use errors::*;
pub use events::*;
pub use execution::*;
pub use metrics::*;
pub use operations::*;
pub use programs::*;
pub use sharding::*;
pub use values::*;
