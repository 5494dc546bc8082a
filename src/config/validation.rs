//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (pool size, window size, timeouts > 0)
//! - Validate route names and URIs
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: TunnelConfig → Result<(), Vec<ValidationError>>

use url::Url;

use crate::config::schema::TunnelConfig;

/// A single semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// True if `name` is usable as a route: non-empty and safe as a URL path
/// segment without escaping.
pub fn is_valid_route_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate a parsed configuration.
pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(ValidationError {
            field: field.to_string(),
            message,
        });
    };

    let router = &config.router;
    if router.window_size == 0 {
        fail("router.window_size", "must be at least 1".into());
    }
    if router.idle_timeout_secs == 0 {
        fail("router.idle_timeout_secs", "must be positive".into());
    }
    if router.sweep_interval_secs == 0 {
        fail("router.sweep_interval_secs", "must be positive".into());
    }
    if router.supported_versions.is_empty() {
        fail(
            "router.supported_versions",
            "at least one protocol version is required".into(),
        );
    }

    let connector = &config.connector;
    if !is_valid_route_name(&connector.route) {
        fail(
            "connector.route",
            format!("'{}' is not a valid route name", connector.route),
        );
    }
    if connector.component.is_empty() {
        fail("connector.component", "must not be empty".into());
    }
    if connector.pool_size == 0 {
        fail("connector.pool_size", "must be at least 1".into());
    }
    if connector.preferred_versions.is_empty() {
        fail(
            "connector.preferred_versions",
            "at least one protocol version is required".into(),
        );
    }
    if connector.backoff_base_ms == 0 || connector.backoff_max_ms < connector.backoff_base_ms {
        fail(
            "connector.backoff_base_ms",
            "base must be positive and no greater than the cap".into(),
        );
    }
    if let Err(e) = Url::parse(&connector.target) {
        fail("connector.target", format!("invalid URI: {e}"));
    }
    for uri in &connector.routers {
        match Url::parse(uri) {
            Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => {}
            Ok(parsed) => fail(
                "connector.routers",
                format!("'{uri}' must use a ws:// or wss:// scheme, got {}", parsed.scheme()),
            ),
            Err(e) => fail("connector.routers", format!("invalid URI '{uri}': {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&TunnelConfig::default()).is_ok());
    }

    #[test]
    fn route_names_must_be_path_segment_safe() {
        assert!(is_valid_route_name("example"));
        assert!(is_valid_route_name("billing-v2"));
        assert!(!is_valid_route_name(""));
        assert!(!is_valid_route_name("a/b"));
        assert!(!is_valid_route_name("a b"));
    }

    #[test]
    fn all_errors_are_reported() {
        let mut config = TunnelConfig::default();
        config.router.window_size = 0;
        config.connector.route = "bad route".into();
        config.connector.pool_size = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn router_uris_must_be_websocket() {
        let mut config = TunnelConfig::default();
        config.connector.routers = vec!["http://localhost:12000".into()];
        assert!(validate_config(&config).is_err());
    }
}
