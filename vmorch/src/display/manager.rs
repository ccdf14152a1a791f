use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::backend::{BackendKind, DisplayBackend};
use super::session::{RemoteDisplaySession, SessionStatus};
use crate::errors::{Error, Result};

/// Owns every display session, keyed by client id, and the backend used for
/// each protocol. `destroy` is the only way a session goes away.
pub struct DisplaySessions {
    backends: HashMap<BackendKind, Arc<dyn DisplayBackend>>,
    sessions: RwLock<HashMap<String, Arc<RemoteDisplaySession>>>,
    default_timeout: Duration,
    cancel_grace: Duration,
}

impl DisplaySessions {
    pub fn new(default_timeout: Duration, cancel_grace: Duration) -> Self {
        Self {
            backends: HashMap::new(),
            sessions: RwLock::new(HashMap::new()),
            default_timeout,
            cancel_grace,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn DisplayBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn create(&self, kind: BackendKind) -> Result<Arc<RemoteDisplaySession>> {
        let backend = self
            .backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("{} display backend", kind)))?;

        let client_id = Uuid::new_v4().to_string();
        let session = Arc::new(RemoteDisplaySession::new(
            client_id.clone(),
            backend,
            self.default_timeout,
            self.cancel_grace,
        ));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.clone(), session.clone());
        info!("Created {} display session {}", kind, client_id);
        Ok(session)
    }

    pub fn get(&self, client_id: &str) -> Result<Arc<RemoteDisplaySession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("display session {}", client_id)))
    }

    pub fn destroy(&self, client_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id)
            .ok_or_else(|| Error::NotFound(format!("display session {}", client_id)))?;
        session.force_cleanup();
        info!("Destroyed display session {}", client_id);
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionStatus> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<_> = sessions.iter().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::session::{DEFAULT_CANCEL_GRACE, DEFAULT_CONNECT_TIMEOUT, SessionState};
    use crate::mock::{ConnectBehavior, MockDisplayBackend};

    fn sessions() -> DisplaySessions {
        DisplaySessions::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_CANCEL_GRACE).with_backend(Arc::new(
            MockDisplayBackend::new(BackendKind::Vnc, ConnectBehavior::Succeed),
        ))
    }

    #[tokio::test]
    async fn create_get_destroy() {
        let sessions = sessions();
        let session = sessions.create(BackendKind::Vnc).unwrap();
        let id = session.client_id().to_string();
        assert!(Uuid::parse_str(&id).is_ok());

        assert_eq!(sessions.get(&id).unwrap().backend_kind(), BackendKind::Vnc);
        assert_eq!(sessions.list().len(), 1);

        sessions.destroy(&id).unwrap();
        assert!(matches!(sessions.get(&id), Err(Error::NotFound(_))));
        assert!(sessions.is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn missing_backend_is_unsupported() {
        let sessions = sessions();
        assert!(matches!(
            sessions.create(BackendKind::Rdp),
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn destroying_unknown_session_fails() {
        let sessions = sessions();
        assert!(matches!(sessions.destroy("nope"), Err(Error::NotFound(_))));
    }
}
