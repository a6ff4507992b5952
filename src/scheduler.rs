use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::accounts::{
    AccountDirectory, AccountKind, AccountRecord, AccountStatus, ApiCredential, GroupDirectory,
    is_rate_limited,
};
use crate::config::RelayConfig;
use crate::error::{AppError, AppResult};
use crate::store::KvStore;

/// Result of one scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub account_id: String,
    pub kind: AccountKind,
}

const ALL_KINDS: &[AccountKind] = &[
    AccountKind::ClaudeOfficial,
    AccountKind::ClaudeConsole,
    AccountKind::Bedrock,
    AccountKind::Ccr,
    AccountKind::GeminiOauth,
    AccountKind::GeminiApi,
];

/// Picks one upstream account per request across every account family,
/// honoring sticky sessions, group bindings, rate-limit back-off, and
/// concurrency caps. All mutable state lives in the shared store and the
/// account directory; overlapping requests race and the loser re-derives.
pub struct UnifiedScheduler {
    accounts: Arc<dyn AccountDirectory>,
    groups: Arc<dyn GroupDirectory>,
    store: Arc<dyn KvStore>,
    config: RelayConfig,
}

impl UnifiedScheduler {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        groups: Arc<dyn GroupDirectory>,
        store: Arc<dyn KvStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            accounts,
            groups,
            store,
            config,
        }
    }

    pub async fn select_account(
        &self,
        credential: &ApiCredential,
        session_key: Option<&str>,
        requested_model: Option<&str>,
    ) -> AppResult<Selection> {
        if credential.is_group_bound() {
            return self
                .select_from_groups(credential, session_key, requested_model)
                .await;
        }

        if let Some(session_key) = session_key {
            if let Some(selection) = self.sticky_hit(session_key, requested_model, None).await {
                self.accounts
                    .mark_used(&selection.account_id, selection.kind)
                    .await;
                return Ok(selection);
            }
        }

        let mut candidates = Vec::new();
        for kind in ALL_KINDS {
            for account in self.accounts.get_all_accounts(*kind).await {
                if self.is_candidate(&account, requested_model).await {
                    candidates.push(account);
                }
            }
        }

        self.finish_selection(candidates, session_key).await
    }

    /// Group-bound path: candidate enumeration is restricted to the bound
    /// groups' member lists instead of the shared pool.
    async fn select_from_groups(
        &self,
        credential: &ApiCredential,
        session_key: Option<&str>,
        requested_model: Option<&str>,
    ) -> AppResult<Selection> {
        let mut member_ids = Vec::new();
        for group_id in [credential.claude_group_id(), credential.gemini_group_id()]
            .into_iter()
            .flatten()
        {
            member_ids.extend(self.groups.get_group_members(group_id).await);
        }

        if let Some(session_key) = session_key {
            if let Some(selection) = self
                .sticky_hit(session_key, requested_model, Some(&member_ids))
                .await
            {
                self.accounts
                    .mark_used(&selection.account_id, selection.kind)
                    .await;
                return Ok(selection);
            }
        }

        let mut candidates = Vec::new();
        for member_id in &member_ids {
            for kind in ALL_KINDS {
                if let Some(account) = self.accounts.get_account(member_id, *kind).await {
                    if self.is_candidate(&account, requested_model).await {
                        candidates.push(account);
                    }
                    break;
                }
            }
        }

        self.finish_selection(candidates, session_key).await
    }

    async fn finish_selection(
        &self,
        mut candidates: Vec<AccountRecord>,
        session_key: Option<&str>,
    ) -> AppResult<Selection> {
        // Fairness: priority first, then least recently used among equals.
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.last_used_at.cmp(&b.last_used_at))
        });

        let Some(chosen) = candidates.into_iter().next() else {
            return Err(AppError::no_capacity("no available accounts"));
        };

        let selection = Selection {
            account_id: chosen.id.clone(),
            kind: chosen.kind,
        };
        if let Some(session_key) = session_key {
            self.write_sticky(session_key, &selection).await;
        }
        self.accounts.mark_used(&chosen.id, chosen.kind).await;
        tracing::debug!(
            account = %chosen.name,
            kind = chosen.kind.as_str(),
            priority = chosen.priority,
            "selected upstream account"
        );
        Ok(selection)
    }

    /// Validates a live affinity record. A hit re-arms the TTL when it has
    /// decayed below the renewal threshold; a stale record is deleted so the
    /// caller falls through to a fresh selection.
    async fn sticky_hit(
        &self,
        session_key: &str,
        requested_model: Option<&str>,
        group_members: Option<&[String]>,
    ) -> Option<Selection> {
        let key = sticky_key(session_key);
        let raw = self.store.get(&key).await?;
        let selection: Selection = match serde_json::from_str(&raw) {
            Ok(selection) => selection,
            Err(_) => {
                self.store.del(&key).await;
                return None;
            }
        };

        if let Some(members) = group_members {
            if !members.contains(&selection.account_id) {
                self.store.del(&key).await;
                return None;
            }
        }

        if !self
            .is_account_available(&selection.account_id, selection.kind, requested_model)
            .await
        {
            tracing::debug!(account = %selection.account_id, "sticky account unavailable, re-selecting");
            self.store.del(&key).await;
            return None;
        }

        let threshold = Duration::from_secs(self.config.sticky_renewal_threshold_seconds);
        if let Some(remaining) = self.store.ttl(&key).await {
            if remaining < threshold {
                self.store
                    .expire(&key, Duration::from_secs(self.config.sticky_ttl_seconds))
                    .await;
            }
        }
        Some(selection)
    }

    async fn write_sticky(&self, session_key: &str, selection: &Selection) {
        let value = serde_json::to_string(selection).unwrap_or_default();
        self.store
            .set_ex(
                &sticky_key(session_key),
                &value,
                Duration::from_secs(self.config.sticky_ttl_seconds),
            )
            .await;
    }

    /// The same predicate set candidate enumeration uses, for one account.
    pub async fn is_account_available(
        &self,
        account_id: &str,
        kind: AccountKind,
        requested_model: Option<&str>,
    ) -> bool {
        match self.accounts.get_account(account_id, kind).await {
            Some(account) => self.is_candidate(&account, requested_model).await,
            None => false,
        }
    }

    async fn is_candidate(&self, account: &AccountRecord, requested_model: Option<&str>) -> bool {
        // Gates group members and sticky re-validation too, not just the
        // shared-pool enumeration.
        if account.kind == AccountKind::GeminiApi && !self.config.allow_api_accounts {
            return false;
        }
        if !account.is_active
            || account.status != AccountStatus::Active
            || !account.is_schedulable()
        {
            return false;
        }
        if is_rate_limited(account, self.config.rate_limit_minutes) {
            return false;
        }
        if let Some(model) = requested_model {
            if !account.supports_model(model) {
                return false;
            }
        }
        if account.max_concurrency > 0 {
            let current = self.accounts.concurrency(&account.id).await;
            if current >= account.max_concurrency {
                return false;
            }
        }
        true
    }

    /// Flags the account limited and drops any affinity pinned to it so the
    /// retry loop cannot re-pick the same account.
    pub async fn mark_rate_limited(
        &self,
        account_id: &str,
        kind: AccountKind,
        session_key: Option<&str>,
    ) {
        tracing::warn!(account = account_id, kind = kind.as_str(), "marking account rate limited");
        self.accounts.set_rate_limited(account_id, kind, true).await;
        if let Some(session_key) = session_key {
            self.store.del(&sticky_key(session_key)).await;
        }
    }

    pub async fn clear_rate_limit(&self, account_id: &str, kind: AccountKind) {
        self.accounts
            .set_rate_limited(account_id, kind, false)
            .await;
    }
}

fn sticky_key(session_key: &str) -> String {
    format!("sticky:{session_key}")
}
