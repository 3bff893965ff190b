//! Browser session lifecycle: launch, liveness, state wipes, teardown and
//! rotation.
//!
//! A [`SessionManager`] owns at most one live [`Session`]. Teardown never
//! fails from the caller's point of view: graceful shutdown is attempted,
//! then any process still referencing the session's profile directory is
//! killed and the profile is deleted.

use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent, RotationReason};
use crate::renderer::{reaper, Identity, RenderContext, Renderer};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_CEILING: Duration = Duration::from_secs(30);

/// One live browser plus its bookkeeping.
pub struct Session {
    pub id: String,
    pub identity: Identity,
    pub started_at: DateTime<Utc>,
    /// Items completed successfully since this session was opened.
    pub completed: u32,
    context: Box<dyn RenderContext>,
}

impl Session {
    pub fn context(&mut self) -> &mut dyn RenderContext {
        self.context.as_mut()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_agent", &self.identity.user_agent)
            .field("started_at", &self.started_at)
            .field("completed", &self.completed)
            .finish()
    }
}

/// Rotating pool of browser identities.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    user_agents: Vec<String>,
    viewport: (u32, u32),
    profile_root: PathBuf,
    next: usize,
}

impl IdentityPool {
    pub fn new(user_agents: Vec<String>, viewport: (u32, u32), profile_root: PathBuf) -> Self {
        let next = if user_agents.len() > 1 {
            rand::thread_rng().gen_range(0..user_agents.len())
        } else {
            0
        };
        Self {
            user_agents,
            viewport,
            profile_root,
            next,
        }
    }

    /// Next identity in round-robin order, with a fresh profile directory.
    pub fn next_identity(&mut self) -> Identity {
        let user_agent = if self.user_agents.is_empty() {
            String::new()
        } else {
            let ua = self.user_agents[self.next % self.user_agents.len()].clone();
            self.next = (self.next + 1) % self.user_agents.len();
            ua
        };
        Identity {
            user_agent,
            viewport: self.viewport,
            profile_dir: self
                .profile_root
                .join(format!("session-{}", uuid::Uuid::new_v4().simple())),
        }
    }

    pub fn profile_root(&self) -> &PathBuf {
        &self.profile_root
    }
}

pub struct SessionManager {
    renderer: Arc<dyn Renderer>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    identities: IdentityPool,
    launch_timeout: Duration,
    max_session_age: Duration,
    current: Option<Session>,
    opened: u32,
    rotations: u32,
}

impl SessionManager {
    /// `profile_scope` is this manager's private profile root; reaping after
    /// a failed launch never reaches beyond it.
    pub fn new(
        config: &HarvestConfig,
        profile_scope: PathBuf,
        renderer: Arc<dyn Renderer>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            renderer,
            clock,
            events,
            identities: IdentityPool::new(
                config.user_agents.clone(),
                config.viewport,
                profile_scope,
            ),
            launch_timeout: config.launch_timeout,
            max_session_age: config.max_session_age,
            current: None,
            opened: 0,
            rotations: 0,
        }
    }

    // ── Single-session operations ─────────

    /// Launch a browser with `identity`. A launch that does not finish within
    /// the launch ceiling is a `Launch` error; leftovers are reaped so the
    /// caller can simply try again.
    pub async fn open(&mut self, identity: Identity) -> Result<Session> {
        let launched =
            tokio::time::timeout(self.launch_timeout, self.renderer.launch(&identity)).await;
        let context = match launched {
            Ok(Ok(context)) => context,
            Ok(Err(err)) => {
                self.cleanup_failed_launch(&identity).await;
                return Err(match err {
                    HarvestError::Launch(_) | HarvestError::Setup(_) => err,
                    other => HarvestError::Launch(other.to_string()),
                });
            }
            Err(_) => {
                self.cleanup_failed_launch(&identity).await;
                return Err(HarvestError::Launch(format!(
                    "browser did not start within {}s",
                    self.launch_timeout.as_secs()
                )));
            }
        };

        self.opened += 1;
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: self.clock.now(),
            completed: 0,
            identity,
            context,
        };
        info!(
            "session {} opened (user agent: {})",
            session.id, session.identity.user_agent
        );
        self.events.emit(HarvestEvent::SessionOpened {
            session_id: session.id.clone(),
            user_agent: session.identity.user_agent.clone(),
        });
        Ok(session)
    }

    /// False when the probe fails or the session outlived its maximum age.
    pub async fn is_healthy(&self, session: &mut Session) -> bool {
        let age = self.clock.now() - session.started_at;
        if age.to_std().unwrap_or_default() > self.max_session_age {
            info!(
                "session {} is {}s old, past the {}s limit",
                session.id,
                age.num_seconds(),
                self.max_session_age.as_secs()
            );
            return false;
        }
        match session.context.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("session {} failed liveness probe: {e}", session.id);
                false
            }
        }
    }

    /// Best-effort teardown that always releases OS resources.
    pub async fn close(&self, session: Session) {
        let Session {
            id,
            identity,
            context,
            ..
        } = session;
        match tokio::time::timeout(SHUTDOWN_CEILING, context.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("session {id} did not shut down cleanly: {e}"),
            Err(_) => warn!("session {id} shutdown timed out"),
        }
        let reaped = self.renderer.reap_orphans(&identity.profile_dir).await;
        if reaped > 0 {
            warn!("session {id} left {reaped} process(es) behind; killed");
        }
        if identity.profile_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&identity.profile_dir) {
                warn!(
                    "failed to remove profile {}: {e}",
                    identity.profile_dir.display()
                );
            }
        }
        info!("session {id} closed");
        self.events.emit(HarvestEvent::SessionClosed { session_id: id });
    }

    /// Wipe cookies and storage without relaunching.
    pub async fn clear_state(&self, session: &mut Session) -> Result<()> {
        session.context.clear_state().await?;
        self.events.emit(HarvestEvent::StateCleared {
            session_id: session.id.clone(),
        });
        Ok(())
    }

    // ── Managed slot ──────────────────────

    /// The live session, launching one if needed.
    pub async fn ensure(&mut self) -> Result<&mut Session> {
        if self.current.is_none() {
            let identity = self.identities.next_identity();
            let session = self.open(identity).await?;
            self.current = Some(session);
        }
        self.current
            .as_mut()
            .ok_or_else(|| HarvestError::Launch("session slot empty after launch".to_string()))
    }

    pub fn current(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub async fn check_current(&mut self) -> bool {
        match self.current.take() {
            Some(mut session) => {
                let healthy = self.is_healthy(&mut session).await;
                self.current = Some(session);
                healthy
            }
            None => false,
        }
    }

    pub async fn clear_current(&mut self) -> Result<()> {
        match self.current.take() {
            Some(mut session) => {
                let result = self.clear_state(&mut session).await;
                self.current = Some(session);
                result
            }
            None => Ok(()),
        }
    }

    /// Tear down the live session (if any) and launch a new one.
    pub async fn rotate(&mut self, reason: RotationReason) -> Result<()> {
        if let Some(session) = self.current.take() {
            self.close(session).await;
        }
        self.rotations += 1;
        info!("rotating browser session ({reason:?})");
        self.events.emit(HarvestEvent::SessionRotated { reason });
        self.ensure().await.map(|_| ())
    }

    /// Close the live session, if any.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.current.take() {
            self.close(session).await;
        }
    }

    /// Kill whatever still runs under this manager's profile scope and drop
    /// its profile directories. Catches sessions whose launch or rotation was
    /// interrupted before they reached the managed slot.
    pub async fn reap_scope(&self) -> usize {
        let scope = self.identities.profile_root().clone();
        let reaped = self.renderer.reap_orphans(&scope).await;
        let removed = reaper::remove_profiles(&scope, None);
        if reaped > 0 || removed > 0 {
            warn!(
                "reaped {reaped} leftover process(es) and {removed} profile(s) under {}",
                scope.display()
            );
        }
        reaped
    }

    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    /// Sessions launched so far.
    pub fn opened(&self) -> u32 {
        self.opened
    }

    async fn cleanup_failed_launch(&self, identity: &Identity) {
        let scope = self.identities.profile_root().clone();
        let reaped = self.renderer.reap_orphans(&scope).await;
        let removed = reaper::remove_profiles(&scope, None);
        warn!(
            "browser launch failed; reaped {reaped} process(es), removed {removed} profile(s) (last: {})",
            identity.profile_dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_pool_cycles_agents_with_fresh_profiles() {
        let agents = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut pool = IdentityPool::new(agents, (1920, 1080), PathBuf::from("/tmp/p"));
        let first = pool.next_identity();
        let second = pool.next_identity();
        let third = pool.next_identity();
        let fourth = pool.next_identity();

        assert_ne!(first.user_agent, second.user_agent);
        assert_ne!(second.user_agent, third.user_agent);
        assert_eq!(first.user_agent, fourth.user_agent);
        assert_ne!(first.profile_dir, fourth.profile_dir);
        assert!(first.profile_dir.starts_with("/tmp/p"));
        assert_eq!(first.viewport, (1920, 1080));
    }

    fn shareable<T: Send + Sync>() {}

    #[test]
    fn manager_can_be_borrowed_across_tasks() {
        // `&SessionManager` is held across awaits inside Send futures.
        shareable::<Session>();
        shareable::<SessionManager>();
    }
}
