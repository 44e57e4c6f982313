//! fleetwatchd library - the agent's self-update subsystem, exposed for the
//! binary and for integration tests.

pub mod config;
pub mod disk;
pub mod dispatcher;
pub mod error;
pub mod exclusion;
pub mod health;
pub mod installer;
pub mod manager;
pub mod marker;
pub mod policy_store;
pub mod progress;
pub mod restart;
pub mod server_client;
pub mod source;
pub mod telemetry;
pub mod transport;
pub mod validator;

pub use dispatcher::CommandDispatcher;
pub use error::UpdateError;
pub use manager::{ManagerOptions, ManagerStatus, SessionOutcome, UpdateManager};
pub use policy_store::{PolicyProvider, PolicyStore};
pub use progress::{ProgressHub, ProgressObserver, RemoteProgressSink};
pub use validator::PostUpdateValidation;
