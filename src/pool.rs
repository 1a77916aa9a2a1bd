// src/pool.rs

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::PoolSettings;
use crate::error::Result;
use crate::member::{
    Disposition, MemberStatus, PoolMember, PoolStats, ReturnOutcome, SessionCredentials,
};
use crate::storage::traits::PoolStore;

/// Orchestrates the member lifecycle over a [`PoolStore`].
///
/// Every state transition is delegated to the store's atomic operations; the
/// manager adds policy glue (leak and recovery scans, warm-up) and the
/// structured logging around it. It holds no member state of its own and is
/// safe to clone handles of across workers.
pub struct PoolManager {
    store: Arc<dyn PoolStore>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
}

impl PoolManager {
    pub fn new(store: Arc<dyn PoolStore>, clock: Arc<dyn Clock>, settings: PoolSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Borrows an idle member with a live session and window budget.
    /// `None` means the pool has nothing to offer right now.
    #[instrument(level = "debug", skip(self))]
    pub async fn borrow(&self) -> Result<Option<PoolMember>> {
        let now = self.clock.now_millis();
        let Some(id) = self.store.borrow(now).await? else {
            debug!("No borrowable member available");
            return Ok(None);
        };
        let member = self.store.read_member(id).await?;
        if member.is_none() {
            // The hash vanished between selection and read; the set entry is
            // already gone, so the caller just retries.
            warn!(user_agent_id = id, "Borrowed member hash missing");
        } else {
            debug!(user_agent_id = id, "Member borrowed");
        }
        Ok(member)
    }

    /// Returns a borrowed member with its crawl outcome.
    #[instrument(level = "debug", skip(self))]
    pub async fn give_back(&self, id: i64, outcome: ReturnOutcome) -> Result<Disposition> {
        let disposition = self
            .store
            .give_back(id, outcome, self.clock.now_millis())
            .await?;
        match disposition {
            Disposition::Idle => debug!(user_agent_id = id, "Member returned to idle"),
            Disposition::Cooldown => {
                warn!(user_agent_id = id, "Member entered cooldown after repeated throttling")
            }
            Disposition::Suspended => {
                warn!(user_agent_id = id, "Member suspended: health below floor")
            }
            Disposition::NotBorrowed => {
                debug!(user_agent_id = id, "Return ignored: member was not borrowed")
            }
        }
        Ok(disposition)
    }

    /// Moves every cooldown member whose window elapsed back into rotation.
    pub async fn recover_cooldowns(&self) -> Result<usize> {
        let recovered = self
            .store
            .recover_cooldowns(self.clock.now_millis())
            .await?;
        if recovered > 0 {
            info!(count = recovered, "Recovered members from cooldown");
        }
        Ok(recovered)
    }

    /// Registers a new member. It enters as SESSION_REQUIRED and becomes
    /// borrowable once credentials are installed.
    pub async fn add_to_pool(&self, id: i64, user_agent_value: impl Into<String>) -> Result<()> {
        let member = PoolMember::new(id, user_agent_value, self.settings.max_tokens);
        self.store.insert_member(&member).await?;
        info!(user_agent_id = id, "Member added to pool");
        Ok(())
    }

    /// Bulk-registers members, skipping ids that already exist so a restart
    /// never resets live state. Returns the number actually inserted.
    pub async fn warm_up(&self, entries: &[(i64, String)]) -> Result<usize> {
        let mut inserted = 0;
        for (id, value) in entries {
            if self.store.read_member(*id).await?.is_some() {
                continue;
            }
            self.add_to_pool(*id, value.clone()).await?;
            inserted += 1;
        }
        info!(
            requested = entries.len(),
            inserted, "Pool warm-up complete"
        );
        Ok(inserted)
    }

    /// Installs freshly issued session credentials and moves the member into
    /// rotation.
    pub async fn update_session(&self, id: i64, session: &SessionCredentials) -> Result<()> {
        self.store.update_session(id, session).await?;
        info!(
            user_agent_id = id,
            expires_at = session.expires_at_millis,
            "Session installed; member idle"
        );
        Ok(())
    }

    /// Clears the member's session and parks it until new credentials arrive.
    pub async fn expire_session(&self, id: i64) -> Result<()> {
        self.store.expire_session(id).await?;
        info!(user_agent_id = id, "Session expired; member awaiting credentials");
        Ok(())
    }

    /// Administratively pulls a member out of rotation.
    pub async fn remove_from_pool(&self, id: i64) -> Result<()> {
        self.store.suspend(id, self.clock.now_millis()).await?;
        warn!(user_agent_id = id, "Member removed from rotation");
        Ok(())
    }

    /// Brings a suspended member back as SESSION_REQUIRED with probation
    /// health and reset counters.
    pub async fn restore_to_pool(&self, id: i64) -> Result<()> {
        self.store.restore(id).await?;
        info!(user_agent_id = id, "Suspended member restored");
        Ok(())
    }

    /// Operator override for a member's health score, clamped to the scale
    /// ceiling. Status is untouched; the next return applies the usual
    /// floor check against the new value.
    pub async fn update_health_score(&self, id: i64, score: u8) -> Result<()> {
        let score = score.min(100);
        self.store.set_health(id, score).await?;
        warn!(user_agent_id = id, score, "Health score manually overridden");
        Ok(())
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<PoolMember>> {
        self.store.read_member(id).await
    }

    pub async fn pool_stats(&self) -> Result<PoolStats> {
        self.store.pool_stats().await
    }

    /// Ids waiting for session credentials.
    pub async fn session_required_ids(&self) -> Result<Vec<i64>> {
        self.store.members_in(MemberStatus::SessionRequired).await
    }

    pub async fn suspended_ids(&self) -> Result<Vec<i64>> {
        self.store.members_in(MemberStatus::Suspended).await
    }

    /// Suspended ids whose recovery window has elapsed and whose health sits
    /// at or above the floor, candidates for [`Self::restore_to_pool`].
    /// Members suspended by health erosion stay out until an operator
    /// restores them.
    pub async fn recoverable_ids(&self) -> Result<Vec<i64>> {
        let now = self.clock.now_millis();
        let mut recoverable = Vec::new();
        for id in self.store.members_in(MemberStatus::Suspended).await? {
            let Some(member) = self.store.read_member(id).await? else {
                continue;
            };
            let window_elapsed = member
                .suspended_at
                .is_some_and(|at| at + self.settings.suspension_recovery_millis <= now);
            if window_elapsed && member.health_score >= self.settings.health_floor {
                recoverable.push(id);
            }
        }
        Ok(recoverable)
    }

    /// Idle ids whose session expires within `buffer_millis`, so credentials
    /// can be renewed before the member drops out of rotation mid-crawl.
    pub async fn session_expiring_ids(&self, buffer_millis: i64) -> Result<Vec<i64>> {
        let deadline = self.clock.now_millis() + buffer_millis;
        let mut expiring = Vec::new();
        for id in self.store.members_in(MemberStatus::Idle).await? {
            let Some(member) = self.store.read_member(id).await? else {
                continue;
            };
            if member.session_expires_at.is_some_and(|at| at <= deadline) {
                expiring.push(id);
            }
        }
        Ok(expiring)
    }

    /// Borrowed ids held longer than the leak threshold. Report-only: the
    /// decision to force a return stays with the operator, since the worker
    /// may still be alive on a slow crawl.
    pub async fn detect_leaked(&self) -> Result<Vec<i64>> {
        let now = self.clock.now_millis();
        let mut leaked = Vec::new();
        for id in self.store.members_in(MemberStatus::Borrowed).await? {
            let Some(member) = self.store.read_member(id).await? else {
                continue;
            };
            if member
                .borrowed_at
                .is_some_and(|at| at + self.settings.leak_threshold_millis <= now)
            {
                leaked.push(id);
            }
        }
        if !leaked.is_empty() {
            warn!(count = leaked.len(), ids = ?leaked, "Leaked borrows detected");
        }
        Ok(leaked)
    }

    /// Deletes every member record and status set.
    pub async fn clear_pool(&self) -> Result<()> {
        self.store.clear().await
    }
}
