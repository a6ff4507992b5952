use async_trait::async_trait;

use crate::accounts::AccountKind;
use crate::claude::Usage;

/// Sink for per-request usage records. The relay reports after every
/// completed response, streaming or not; failures to record never fail the
/// request.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(
        &self,
        credential_id: &str,
        usage: &Usage,
        model: &str,
        account_id: &str,
        kind: AccountKind,
    );
}

/// Default sink: exports counters to the process metrics registry.
#[derive(Debug, Default)]
pub struct MetricsUsageSink;

#[async_trait]
impl UsageSink for MetricsUsageSink {
    async fn record(
        &self,
        credential_id: &str,
        usage: &Usage,
        model: &str,
        account_id: &str,
        kind: AccountKind,
    ) {
        let labels = [
            ("model", model.to_string()),
            ("account", account_id.to_string()),
            ("kind", kind.as_str().to_string()),
        ];
        metrics::counter!("gembridge_input_tokens_total", &labels).increment(usage.input_tokens);
        metrics::counter!("gembridge_output_tokens_total", &labels).increment(usage.output_tokens);
        metrics::counter!("gembridge_cache_read_tokens_total", &labels)
            .increment(usage.cache_read_input_tokens);
        tracing::info!(
            credential = credential_id,
            model,
            account = account_id,
            kind = kind.as_str(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "usage recorded"
        );
    }
}
