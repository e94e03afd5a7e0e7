//! Engine configuration

use crate::{ConfigError, GpaScale, GradebookError, GradebookResult, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the coordinator purges cached reports after a single grade change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Remove only entries whose dependency tags match the change.
    #[default]
    DependencyIndex,
    /// Remove every cached entry on every change.
    FlushAll,
}

impl InvalidationPolicy {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            InvalidationPolicy::DependencyIndex => "dependency_index",
            InvalidationPolicy::FlushAll => "flush_all",
        }
    }
}

impl fmt::Display for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for InvalidationPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "dependency_index" | "index" | "tags" => Ok(InvalidationPolicy::DependencyIndex),
            "flush_all" | "flush" | "all" => Ok(InvalidationPolicy::FlushAll),
            other => Err(ValidationError::InvalidValue {
                field: "invalidation_policy".to_string(),
                reason: format!("unknown invalidation policy '{}'", other),
            }),
        }
    }
}

/// Runtime configuration of the engine.
///
/// Built once at start-up and carried by the engine context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of a cached report payload.
    pub report_ttl: Duration,
    /// Entry count above which the cache evicts its oldest entries.
    pub cache_capacity: usize,
    pub gpa_scale: GpaScale,
    pub invalidation_policy: InvalidationPolicy,
    /// Extra attempts after a failed invalidation before it is reported.
    pub invalidation_retries: u32,
    pub at_risk_page_size_max: u32,
    pub at_risk_default_page_size: u32,
    pub performance_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            report_ttl: Duration::from_secs(300),
            cache_capacity: 1000,
            gpa_scale: GpaScale::Philippine,
            invalidation_policy: InvalidationPolicy::DependencyIndex,
            invalidation_retries: 2,
            at_risk_page_size_max: 100,
            at_risk_default_page_size: 10,
            performance_page_size: 10,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> GradebookResult<()> {
        if self.report_ttl.is_zero() {
            return Err(invalid(
                "report_ttl",
                format!("{:?}", self.report_ttl),
                "report_ttl must be greater than 0",
            ));
        }

        if self.cache_capacity == 0 {
            return Err(invalid(
                "cache_capacity",
                self.cache_capacity.to_string(),
                "cache_capacity must be greater than 0",
            ));
        }

        if self.invalidation_retries > 10 {
            return Err(invalid(
                "invalidation_retries",
                self.invalidation_retries.to_string(),
                "invalidation_retries must be at most 10",
            ));
        }

        if self.at_risk_page_size_max == 0 {
            return Err(invalid(
                "at_risk_page_size_max",
                self.at_risk_page_size_max.to_string(),
                "at_risk_page_size_max must be greater than 0",
            ));
        }

        if self.at_risk_default_page_size == 0
            || self.at_risk_default_page_size > self.at_risk_page_size_max
        {
            return Err(invalid(
                "at_risk_default_page_size",
                self.at_risk_default_page_size.to_string(),
                "at_risk_default_page_size must be between 1 and at_risk_page_size_max",
            ));
        }

        if self.performance_page_size == 0 {
            return Err(invalid(
                "performance_page_size",
                self.performance_page_size.to_string(),
                "performance_page_size must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Load from `GRADEBOOK_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            report_ttl: std::env::var("GRADEBOOK_REPORT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.report_ttl),
            cache_capacity: std::env::var("GRADEBOOK_CACHE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_capacity),
            gpa_scale: std::env::var("GRADEBOOK_GPA_SCALE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.gpa_scale),
            invalidation_policy: std::env::var("GRADEBOOK_INVALIDATION_POLICY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.invalidation_policy),
            invalidation_retries: std::env::var("GRADEBOOK_INVALIDATION_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.invalidation_retries),
            at_risk_page_size_max: std::env::var("GRADEBOOK_AT_RISK_PAGE_SIZE_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.at_risk_page_size_max),
            at_risk_default_page_size: std::env::var("GRADEBOOK_AT_RISK_DEFAULT_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.at_risk_default_page_size),
            performance_page_size: std::env::var("GRADEBOOK_PERFORMANCE_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.performance_page_size),
        }
    }

    pub fn with_report_ttl(mut self, ttl: Duration) -> Self {
        self.report_ttl = ttl;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_gpa_scale(mut self, scale: GpaScale) -> Self {
        self.gpa_scale = scale;
        self
    }

    pub fn with_invalidation_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.invalidation_policy = policy;
        self
    }

    /// Clamp a requested at-risk page size into `[1, at_risk_page_size_max]`.
    pub fn clamp_at_risk_page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.at_risk_default_page_size)
            .clamp(1, self.at_risk_page_size_max)
    }
}

fn invalid(field: &str, value: String, reason: &str) -> GradebookError {
    GradebookError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.report_ttl, Duration::from_secs(300));
        assert_eq!(config.cache_capacity, 1000);
        assert_eq!(config.at_risk_page_size_max, 100);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = EngineConfig::default().with_report_ttl(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            GradebookError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "report_ttl"
        ));
    }

    #[test]
    fn test_default_page_size_must_fit_max() {
        let config = EngineConfig {
            at_risk_page_size_max: 5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_at_risk_page_size() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_at_risk_page_size(None), 10);
        assert_eq!(config.clamp_at_risk_page_size(Some(500)), 100);
        assert_eq!(config.clamp_at_risk_page_size(Some(0)), 1);
        assert_eq!(config.clamp_at_risk_page_size(Some(25)), 25);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("flush-all".parse::<InvalidationPolicy>(), Ok(InvalidationPolicy::FlushAll));
        assert_eq!(
            "dependency_index".parse::<InvalidationPolicy>(),
            Ok(InvalidationPolicy::DependencyIndex)
        );
        assert!("sometimes".parse::<InvalidationPolicy>().is_err());
    }

    #[test]
    fn test_config_serde() -> Result<(), serde_json::Error> {
        let config = EngineConfig::default().with_gpa_scale(GpaScale::FourPoint);
        let json = serde_json::to_string(&config)?;
        assert!(json.contains("four_point"));
        let back: EngineConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }
}
