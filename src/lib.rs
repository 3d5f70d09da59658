mod backoff;
mod config;
mod dispatcher;
mod error;
mod flag;
mod readiness;
mod remote;
mod snapshot;
mod status;
mod store;
mod test_common;

pub use backoff::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use flag::*;
pub use readiness::*;
pub use remote::*;
pub use snapshot::*;
pub use status::*;
pub use store::*;
