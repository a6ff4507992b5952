use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Upstream account families the scheduler can hand out. The claude family
/// is relayed through its own path; the gemini family is what this gateway
/// translates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    #[serde(rename = "claude-official")]
    ClaudeOfficial,
    #[serde(rename = "claude-console")]
    ClaudeConsole,
    #[serde(rename = "bedrock")]
    Bedrock,
    #[serde(rename = "ccr")]
    Ccr,
    /// OAuth account, called through the PA API envelope.
    #[serde(rename = "gemini")]
    GeminiOauth,
    /// Plain API key against the public generateContent API.
    #[serde(rename = "gemini-api")]
    GeminiApi,
}

impl AccountKind {
    pub fn is_gemini(self) -> bool {
        matches!(self, AccountKind::GeminiOauth | AccountKind::GeminiApi)
    }

    pub fn is_claude_family(self) -> bool {
        !self.is_gemini()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::ClaudeOfficial => "claude-official",
            AccountKind::ClaudeConsole => "claude-console",
            AccountKind::Bedrock => "bedrock",
            AccountKind::Ccr => "ccr",
            AccountKind::GeminiOauth => "gemini",
            AccountKind::GeminiApi => "gemini-api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Error,
    Blocked,
    TempError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    pub kind: AccountKind,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_status")]
    pub status: AccountStatus,
    /// Tri-state: only a literal `false` takes the account out of rotation.
    #[serde(default)]
    pub schedulable: Option<bool>,
    /// Empty means any model.
    #[serde(default)]
    pub supported_models: Vec<String>,
    /// Zero means uncapped.
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limit_minutes: Option<u64>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_priority() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

fn default_status() -> AccountStatus {
    AccountStatus::Active
}

impl AccountRecord {
    pub fn is_schedulable(&self) -> bool {
        self.schedulable != Some(false)
    }

    /// Model allow-list check. Names compare with an optional `models/`
    /// namespace prefix stripped from both sides.
    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        let wanted = strip_model_prefix(model);
        self.supported_models
            .iter()
            .any(|m| strip_model_prefix(m) == wanted)
    }
}

pub fn strip_model_prefix(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

/// Caller credential. Account bindings may point at a single account id or
/// at a group via the `group:` prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub claude_account_id: Option<String>,
    #[serde(default)]
    pub gemini_account_id: Option<String>,
}

impl ApiCredential {
    pub fn claude_group_id(&self) -> Option<&str> {
        extract_group_id(self.claude_account_id.as_deref())
    }

    pub fn gemini_group_id(&self) -> Option<&str> {
        extract_group_id(self.gemini_account_id.as_deref())
    }

    pub fn is_group_bound(&self) -> bool {
        self.claude_group_id().is_some() || self.gemini_group_id().is_some()
    }
}

fn extract_group_id(binding: Option<&str>) -> Option<&str> {
    binding.and_then(|id| id.strip_prefix("group:"))
}

/// Account lookup and bookkeeping, backed by whatever persistence the
/// deployment uses.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn get_account(&self, id: &str, kind: AccountKind) -> Option<AccountRecord>;
    async fn get_all_accounts(&self, kind: AccountKind) -> Vec<AccountRecord>;
    async fn mark_used(&self, id: &str, kind: AccountKind);
    async fn set_rate_limited(&self, id: &str, kind: AccountKind, limited: bool);
    async fn concurrency(&self, id: &str) -> u32;
    async fn adjust_concurrency(&self, id: &str, delta: i32);
    /// Refreshes the OAuth token and returns the fresh access token.
    async fn refresh_token(&self, id: &str, kind: AccountKind) -> Result<String, AppError>;
}

/// Resolves group membership per platform family.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn get_group_members(&self, group_id: &str) -> Vec<String>;
}

/// Resolves inbound API tokens to caller credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<ApiCredential>;
}

/// Config-seeded implementation of the account, group, and credential
/// lookups. Deployments with an external account store swap these traits
/// out; the relay only sees the trait objects.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    accounts: dashmap::DashMap<String, AccountRecord>,
    concurrency: dashmap::DashMap<String, u32>,
    groups: dashmap::DashMap<String, Vec<String>>,
    credentials: dashmap::DashMap<String, ApiCredential>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: AccountRecord) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn insert_group(&self, group_id: &str, members: Vec<String>) {
        self.groups.insert(group_id.to_string(), members);
    }

    pub fn insert_credential(&self, token: &str, credential: ApiCredential) {
        self.credentials.insert(token.to_string(), credential);
    }
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn get_account(&self, id: &str, kind: AccountKind) -> Option<AccountRecord> {
        self.accounts
            .get(id)
            .filter(|a| a.kind == kind)
            .map(|a| a.clone())
    }

    async fn get_all_accounts(&self, kind: AccountKind) -> Vec<AccountRecord> {
        self.accounts
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.clone())
            .collect()
    }

    async fn mark_used(&self, id: &str, _kind: AccountKind) {
        if let Some(mut account) = self.accounts.get_mut(id) {
            account.last_used_at = Some(Utc::now());
        }
    }

    async fn set_rate_limited(&self, id: &str, _kind: AccountKind, limited: bool) {
        if let Some(mut account) = self.accounts.get_mut(id) {
            account.rate_limited_at = limited.then(Utc::now);
        }
    }

    async fn concurrency(&self, id: &str) -> u32 {
        self.concurrency.get(id).map(|c| *c).unwrap_or(0)
    }

    async fn adjust_concurrency(&self, id: &str, delta: i32) {
        let mut entry = self.concurrency.entry(id.to_string()).or_insert(0);
        *entry = entry.saturating_add_signed(delta);
    }

    async fn refresh_token(&self, id: &str, _kind: AccountKind) -> Result<String, AppError> {
        // No OAuth backend here; hand back the stored token and let the
        // upstream reject it if it is truly dead.
        self.accounts
            .get(id)
            .and_then(|a| a.access_token.clone())
            .ok_or_else(|| AppError::internal("account has no access token to refresh"))
    }
}

#[async_trait]
impl GroupDirectory for MemoryDirectory {
    async fn get_group_members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .get(group_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CredentialStore for MemoryDirectory {
    async fn authenticate(&self, token: &str) -> Option<ApiCredential> {
        self.credentials.get(token).map(|c| c.clone())
    }
}

pub fn is_token_expired(account: &AccountRecord) -> bool {
    match account.token_expires_at {
        Some(at) => at <= Utc::now() + chrono::Duration::seconds(60),
        None => false,
    }
}

pub fn is_rate_limited(account: &AccountRecord, default_minutes: u64) -> bool {
    let Some(at) = account.rate_limited_at else {
        return false;
    };
    let minutes = account.rate_limit_minutes.unwrap_or(default_minutes);
    at + chrono::Duration::minutes(minutes as i64) > Utc::now()
}
