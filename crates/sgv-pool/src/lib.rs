//! # sgv-pool
//!
//! A caching, clustering scatter-gather page allocator.
//!
//! The crate hands out scatter-gather (SG) lists whose backing pages total
//! a requested byte size, designed for SCSI-style I/O submission paths
//! where per-request overhead matters:
//!
//! - **Per-pool caches**: allocations are rounded to a power-of-two page
//!   order and recycled through per-order free-lists, so a steady workload
//!   is served almost entirely by cache hits.
//! - **Clustering**: physically adjacent pages merge into fewer, longer SG
//!   entries, with a translation table mapping logical page positions back
//!   to entries.
//! - **Aging and reclaim**: returned objects sit on a per-pool LRU; a
//!   delayed purge worker destroys stale ones, and a cross-pool shrinker
//!   walks the active pools round-robin under watermark or external memory
//!   pressure.
//! - **Watermarks**: a global page total gates admission; overshooting the
//!   high watermark triggers a synchronous shrink before the allocation is
//!   allowed through.
//!
//! # Usage
//!
//! ```
//! use sgv_pool::{AllocFlags, ClusteringMode, SgvAllocator, SgvConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let allocator = SgvAllocator::new(SgvConfig::new(1024, 512))?;
//! let pool = allocator.create("io", ClusteringMode::Full)?;
//!
//! let handle = pool
//!     .alloc(16 * 1024, AllocFlags::new(), None, None, None)
//!     .map_err(|failure| failure.error)?;
//! // Each entry is a (page, offset, length) run ready for the transport.
//! let mapped: u64 = handle.sg().iter().map(|e| u64::from(e.length)).sum();
//! assert_eq!(mapped, 16 * 1024);
//! handle.free(None);
//!
//! allocator.destroy(pool);
//! # Ok(())
//! # }
//! ```
//!
//! Pools are created from an explicit [`SgvAllocator`] context; there are
//! no process-wide statics. Time, delayed work and the page source are all
//! trait objects ([`clock::Clock`], [`timer::PurgeScheduler`],
//! [`PageSource`]), with production implementations provided and manual
//! ones available for tests and embedders.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod cluster;
mod obj;
mod pool;
mod registry;

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod mem_limit;
pub mod page;
pub mod source;
pub mod stats;
pub mod timer;

pub use cluster::ClusteringMode;
pub use config::SgvConfig;
pub use error::{SgvError, SgvResult};
pub use mem_limit::MemLimit;
pub use page::{PageFrame, SgEntry, TransTblEnt};
pub use pool::{AllocFailure, AllocFlags, SgvHandle, SgvPool};
pub use registry::{OwnerTag, RawSg, SgvAllocator};
pub use source::{AllocCookie, PageSource, SystemPageSource};
pub use stats::{BucketStats, GlobalStats, PoolStats, RegimeStats};
