//! Server-side binding between normalized endpoints and rate-limit
//! defaults (`spec.md` §6: "Rate-limit defaults (rate per minute, burst)").

use edgeplane_core::ratelimit::{BucketConfig, EndpointLimits};

fn per_minute(rate_per_minute: f64, burst: f64) -> BucketConfig {
    BucketConfig {
        rate_per_second: rate_per_minute / 60.0,
        burst,
    }
}

/// Static table of per-endpoint-family rate limits.
pub struct EndpointLimitsTable {
    default: BucketConfig,
    overrides: Vec<(&'static str, BucketConfig)>,
}

impl EndpointLimitsTable {
    /// The defaults listed in `spec.md` §6.
    pub fn with_spec_defaults() -> Self {
        Self {
            default: per_minute(100.0, 200.0),
            overrides: vec![
                ("/enroll", per_minute(10.0, 20.0)),
                ("/v1/enroll", per_minute(10.0, 20.0)),
                ("/agents/heartbeat", per_minute(60.0, 120.0)),
                ("/v1/heartbeat", per_minute(60.0, 120.0)),
                ("/tenants", per_minute(5.0, 10.0)),
                ("/tenants/{id}/api-keys", per_minute(10.0, 20.0)),
            ],
        }
    }
}

impl EndpointLimits for EndpointLimitsTable {
    fn config_for(&self, endpoint: &str) -> BucketConfig {
        self.overrides
            .iter()
            .find(|(prefix, _)| endpoint == *prefix || endpoint.starts_with(prefix))
            .map_or(self.default, |(_, config)| *config)
    }
}
