// The mesh session: gateway selection, auth, keep-alive, write serialisation.

mod session;

pub use session::{MeshSession, SessionError, SessionState, DEFAULT_PING_INTERVAL};
