use failsafe::backoff::Exponential;
use failsafe::failure_policy::ConsecutiveFailures;
use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// Breaker type shared by every external provider.
pub type ProviderBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for an external provider to prevent cascading failures.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive transient failures trigger OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, requests fail fast.
/// - **HALF_OPEN**: Testing if service recovered.
///
/// # Returns
///
/// * `ProviderBreaker` - The configured circuit breaker instance (cheap to clone).
pub fn create_provider_circuit_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Runs `fut` through `breaker`.
///
/// Only transient errors count as failures: a 404 or a malformed body says
/// nothing about provider health. A rejected call surfaces as a transient
/// `ExternalApiError` so callers back off like for any outage.
pub async fn guarded<T, Fut>(
    breaker: &ProviderBreaker,
    provider: &str,
    fut: Fut,
) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    use failsafe::futures::CircuitBreaker;

    match breaker
        .call_with(|e: &AppError| e.is_transient(), fut)
        .await
    {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(e),
        Err(failsafe::Error::Rejected) => {
            tracing::warn!("⚠ Circuit open for {}, call rejected", provider);
            Err(AppError::ExternalApiError(format!(
                "{} circuit breaker is open",
                provider
            )))
        }
    }
}

/// One breaker per enrichment provider.
#[derive(Clone)]
pub struct ProviderBreakers {
    pub whois: ProviderBreaker,
    pub website: ProviderBreaker,
    pub cnpj: ProviderBreaker,
    pub whatsapp: ProviderBreaker,
}

impl ProviderBreakers {
    pub fn new() -> Self {
        Self {
            whois: create_provider_circuit_breaker(),
            website: create_provider_circuit_breaker(),
            cnpj: create_provider_circuit_breaker(),
            whatsapp: create_provider_circuit_breaker(),
        }
    }
}

impl Default for ProviderBreakers {
    fn default() -> Self {
        Self::new()
    }
}
