// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! LLM provider implementations.
//!
//! Every configured endpoint speaks the Anthropic Messages protocol, either
//! directly or through a compatible proxy:
//!
//! - [`anthropic::AnthropicProvider`] - one instance per endpoint URL
//!
//! ```rust,ignore
//! use conductor::config::EndpointConfig;
//! use conductor::providers::create_provider;
//!
//! let endpoint = EndpointConfig::new("local", "http://localhost:8080");
//! let provider = create_provider(&endpoint, "claude-sonnet-4-20250514", timeout)?;
//! let response = provider.complete(&request).await?;
//! ```

pub mod anthropic;

pub use anthropic::AnthropicProvider;

use std::sync::Arc;
use std::time::Duration;

use crate::config::EndpointConfig;
use crate::error::ProviderError;
use crate::types::SharedProvider;

/// Create a provider for one configured endpoint.
///
/// The endpoint's model override wins over `default_model`.
pub fn create_provider(
    endpoint: &EndpointConfig,
    default_model: &str,
    health_timeout: Duration,
) -> Result<SharedProvider, ProviderError> {
    if endpoint.url.trim().is_empty() {
        return Err(ProviderError::NotConfigured(format!(
            "endpoint '{}' has no url",
            endpoint.name
        )));
    }
    let model = endpoint.model.clone().unwrap_or_else(|| default_model.to_string());
    let provider = AnthropicProvider::new(
        endpoint.name.clone(),
        endpoint.url.clone(),
        model,
        endpoint.resolve_api_key(),
        None,
    )?
    .with_health_timeout(health_timeout);
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    #[test]
    fn test_create_provider_uses_endpoint_name() {
        let endpoint = EndpointConfig::new("proxy", "http://localhost:8080");
        let provider = create_provider(&endpoint, "m", Duration::from_secs(1)).unwrap();
        assert_eq!(provider.name(), "proxy");
    }

    #[test]
    fn test_create_provider_rejects_empty_url() {
        let endpoint = EndpointConfig::new("broken", "  ");
        assert!(matches!(
            create_provider(&endpoint, "m", Duration::from_secs(1)),
            Err(ProviderError::NotConfigured(_))
        ));
    }
}
