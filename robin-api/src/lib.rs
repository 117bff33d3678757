//! Front-end registry HTTP API: the only writable surface into
//! Robin's routing intent. Operators and orchestration tooling register and
//! remove `FrontendRecord`s here; the reconciler only ever reads them back
//! out through the same `KvStore` the topology sources use.

pub mod error;
pub mod registry;
pub mod server;

pub use error::{Error, Result};
pub use registry::FrontendRegistry;
pub use server::run;
