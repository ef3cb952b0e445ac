//! In-memory reference implementation of every contract `tunnox-core`
//! declares but doesn't implement (spec §6, `tunnox_core::contracts`): the
//! KV, the cross-node broker, the cloud-control plane, the node directory,
//! and the pre-auth policy chain (`SPEC_FULL.md` §C). A single-node
//! development server or a test harness can wire `tunnox-core` entirely
//! against this crate; a cluster deployment is expected to replace each
//! piece independently (a real KV, a real pub/sub, a real identity store)
//! without touching the core.

pub mod broker;
pub mod control;
pub mod directory;
pub mod kv;
pub mod policy;

pub use broker::InMemoryBroker;
pub use control::InMemoryCloudControl;
pub use directory::StaticNodeDirectory;
pub use kv::InMemoryKv;
pub use policy::{AllowAllIpPolicy, FixedWindowAnonymousRateLimiter, FixedWindowBruteForceGuard};
