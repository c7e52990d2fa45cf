//! Built-in provider adapters.
//!
//! Real inference engines live out-of-tree behind the
//! [`edgerun_kernel::provider::ProviderAdapter`] contract; the runtime
//! ships only the deterministic mock used by tests and host smoke runs.

pub mod mock;

pub use mock::{MockProvider, MockProviderBuilder};
