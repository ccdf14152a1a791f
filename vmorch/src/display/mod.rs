pub mod backend;
pub mod manager;
pub mod session;

pub use backend::{BackendKind, CancelFlag, DisplayBackend, DisplayTarget, TcpDisplayBackend};
pub use manager::DisplaySessions;
pub use session::{RemoteDisplaySession, SessionState, SessionStatus};
