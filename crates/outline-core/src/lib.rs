pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod git;
pub mod github;
pub mod pipeline;
pub mod poller;
pub mod registry;
pub mod remote;
pub mod session;
pub mod sink;
pub mod types;
pub mod workspace;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, PipelineError, RegistryError, RemoteApiError};
pub use registry::{InMemoryRunStore, RunStore};
pub use remote::RemoteRepo;
pub use session::{Session, SessionHandle};
pub use types::{Conclusion, Run, RunEvent, RunOrigin, RunState, RunStatus};
