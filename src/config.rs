use once_cell::sync::Lazy;

/// Name of the quota definition assigned to organizations created without one.
pub static DEFAULT_QUOTA_DEFINITION: Lazy<String> = Lazy::new(|| {
    read_optional_env("DEFAULT_QUOTA_DEFINITION").unwrap_or_else(|| "default".to_string())
});

/// Stack used when an application does not name one. Defaults to `lucid64`.
pub static DEFAULT_STACK: Lazy<String> =
    Lazy::new(|| read_optional_env("DEFAULT_STACK").unwrap_or_else(|| "lucid64".to_string()));

/// Unique id of the service plan treated as the trial database plan. Unset means no plan is
/// a trial plan.
pub static TRIAL_DB_PLAN_UNIQUE_ID: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("TRIAL_DB_PLAN_UNIQUE_ID"));

/// Base URL of the placement layer that executes start/stop/scale intents.
pub static PLACEMENT_ENDPOINT: Lazy<String> = Lazy::new(|| {
    read_optional_env("PLACEMENT_ENDPOINT").unwrap_or_else(|| "http://127.0.0.1:8787".to_string())
});

/// Optional shared secret used to sign placement requests with HMAC-SHA256.
pub static PLACEMENT_SIGNING_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PLACEMENT_SIGNING_SECRET"));

/// key: placement-config -> outbox scan cadence
pub static PLACEMENT_POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("PLACEMENT_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// key: placement-config -> delivery attempts before an intent is parked as failed
pub static PLACEMENT_MAX_ATTEMPTS: Lazy<i32> = Lazy::new(|| {
    std::env::var("PLACEMENT_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// Timeout applied to service gateway calls when the service does not declare its own.
pub static SERVICE_GATEWAY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SERVICE_GATEWAY_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// Symmetric key for service instance and binding credentials at rest.
pub static CREDENTIALS_ENCRYPTION_KEY: Lazy<String> = Lazy::new(|| {
    read_optional_env("CREDENTIALS_ENCRYPTION_KEY").unwrap_or_else(|| "secret".to_string())
});

/// When set to a truthy value, allows the dispatcher to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
