use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::social::{Session, SocialApi};

/// Owns the authenticated session handle and refreshes it on demand.
pub struct SessionManager {
    api: Arc<dyn SocialApi>,
    identifier: String,
    secret: String,
    session: RwLock<Option<Session>>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn SocialApi>, identifier: String, secret: String) -> Self {
        Self {
            api,
            identifier,
            secret,
            session: RwLock::new(None),
        }
    }

    /// Return the cached session, logging in first if there is none.
    pub async fn ensure_authenticated(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }

        let mut slot = self.session.write().await;
        // Another task may have logged in while we waited for the write lock.
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Force a fresh login. A rejection surfaces as `AgentError::Auth` and the
    /// cached session is cleared; nothing here retries.
    pub async fn authenticate(&self) -> Result<Session> {
        let mut slot = self.session.write().await;
        match self.login().await {
            Ok(session) => {
                *slot = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    /// Drop the cached session after the remote reported it expired.
    pub async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    pub async fn account_id(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.account_id.clone())
    }

    async fn login(&self) -> Result<Session> {
        tracing::info!("Authenticating as {}", self.identifier);
        let session = self.api.authenticate(&self.identifier, &self.secret).await?;
        tracing::info!("Authenticated as {} ({})", self.identifier, session.account_id);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSocialApi;

    #[tokio::test]
    async fn caches_session_between_calls() {
        let api = Arc::new(FakeSocialApi::new("did:plc:bot"));
        let sessions = SessionManager::new(api.clone(), "bot".into(), "secret".into());

        let first = sessions.ensure_authenticated().await.unwrap();
        let second = sessions.ensure_authenticated().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.auth_calls(), 1);
        assert_eq!(sessions.account_id().await.as_deref(), Some("did:plc:bot"));
    }

    #[tokio::test]
    async fn reauthenticates_after_invalidate() {
        let api = Arc::new(FakeSocialApi::new("did:plc:bot"));
        let sessions = SessionManager::new(api.clone(), "bot".into(), "secret".into());

        sessions.ensure_authenticated().await.unwrap();
        sessions.invalidate().await;
        sessions.ensure_authenticated().await.unwrap();

        assert_eq!(api.auth_calls(), 2);
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_auth_error() {
        let api = Arc::new(FakeSocialApi::new("did:plc:bot"));
        api.reject_logins(true);
        let sessions = SessionManager::new(api.clone(), "bot".into(), "wrong".into());

        let err = sessions.ensure_authenticated().await.unwrap_err();
        assert!(err.is_auth());
        assert!(sessions.account_id().await.is_none());
        assert_eq!(api.auth_calls(), 1);
    }
}
