//! Lifetime and concurrency core for binding a native geospatial library to a garbage-collected host.
//!
//! Native resources (datasets and everything living under them, spatial references, geometries) are registered in an
//! [`ObjectRegistry`] under stable identifiers, wrapped in reference-counted [`HostObject`]s, and released through a
//! [`NativeLibrary`] once their wrappers become unreachable. Native calls are made by [`Job`]s, whose native steps run on
//! a [`WorkerPool`] under the lock of every dataset they touch, and whose completion steps run back on the thread owning
//! the [`ControlLoop`].
#![deny(missing_docs)]

mod control;
pub use self::control::ControlLoop;

mod dispatch;
pub use self::dispatch::{WorkerPool, WorkerPoolConfiguration};

mod error;
pub use self::error::{Error, NativeError};

mod handle;
pub use self::handle::{NativePtr, ResourceHandle, ResourceId, ResourceKind};

mod host;
pub use self::host::{HostObject, HostRef};

mod job;
pub use self::job::Job;

mod native;
pub use self::native::NativeLibrary;

pub mod registry;
pub use self::registry::ObjectRegistry;

#[cfg(test)]
mod test_util;
