pub mod guard;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod sessions;
pub mod state;
pub mod store;

pub use guard::{LifecycleError, Liveness};
pub use protocol::{
    read_message, write_message, CommandError, DaemonPhase, ProtocolError, Request, Response,
    Stage,
};
pub use server::{DaemonServer, RunOutcome};
pub use state::{DaemonState, Shared};
