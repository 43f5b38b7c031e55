//! Engine configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ClientTier, StakeholderLevel, StrategicImportance};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub weights: PriorityWeights,
    pub scoring: ScoringConfig,
    pub matching: MatchingConfig,
    pub queue: QueueConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
    pub recovery: RecoveryConfig,
}

impl EngineConfig {
    /// Read and validate a TOML file. Missing sections keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: EngineConfig =
            toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("validate {}", path.display()))?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize engine config")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        self.scoring.validate()?;
        self.matching.validate()?;
        self.queue.validate()?;
        self.optimizer.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

/// Weights of the five priority sub-scores. Must sum to 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub urgency: f64,
    pub impact: f64,
    pub resource: f64,
    pub revenue: f64,
    pub dependency: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            urgency: 0.25,
            impact: 0.30,
            resource: 0.20,
            revenue: 0.15,
            dependency: 0.10,
        }
    }
}

impl PriorityWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("urgency", self.urgency),
            ("impact", self.impact),
            ("resource", self.resource),
            ("revenue", self.revenue),
            ("dependency", self.dependency),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }
        let sum: f64 = named.iter().map(|(_, value)| value).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Urgency of a task with no deadline before any aging.
    pub no_deadline_baseline: f64,
    /// Urgency gained per day of waiting.
    pub aging_per_day: f64,
    /// Cap on the aging bonus applied to deadline bands.
    pub max_aging_bonus: f64,
    pub critical_within_hours: f64,
    pub high_within_hours: f64,
    pub medium_within_hours: f64,
    /// Applied when remaining time is below 1.5x the estimated effort.
    pub tight_deadline_multiplier: f64,
    /// Urgency added per automated retry already spent.
    pub retry_boost: f64,
    /// Urgency added per rebalance cycle without a qualified worker.
    pub starvation_boost: f64,
    /// Revenue normalization denominator.
    pub pipeline_reference_value: f64,
    /// Dependency score contributed by each pending dependent.
    pub per_dependent: f64,
    pub impact: ImpactTables,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            no_deadline_baseline: 0.2,
            aging_per_day: 0.1,
            max_aging_bonus: 0.5,
            critical_within_hours: 2.0,
            high_within_hours: 24.0,
            medium_within_hours: 168.0,
            tight_deadline_multiplier: 1.3,
            retry_boost: 0.1,
            starvation_boost: 0.05,
            pipeline_reference_value: 10_000.0,
            per_dependent: 0.2,
            impact: ImpactTables::default(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("scoring.no_deadline_baseline", self.no_deadline_baseline),
            ("scoring.aging_per_day", self.aging_per_day),
            ("scoring.max_aging_bonus", self.max_aging_bonus),
            ("scoring.tight_deadline_multiplier", self.tight_deadline_multiplier),
            ("scoring.retry_boost", self.retry_boost),
            ("scoring.starvation_boost", self.starvation_boost),
            ("scoring.pipeline_reference_value", self.pipeline_reference_value),
            ("scoring.per_dependent", self.per_dependent),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::setting(name, format!("{value} is not a non-negative number")));
            }
        }
        if !(self.critical_within_hours <= self.high_within_hours
            && self.high_within_hours <= self.medium_within_hours)
        {
            return Err(ConfigError::setting(
                "scoring.*_within_hours",
                "deadline bands must be ordered critical <= high <= medium",
            ));
        }
        self.impact.validate()
    }
}

/// Multiplier tables for the business-impact sub-score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactTables {
    pub base: f64,
    pub client_tier: ClientTierMultipliers,
    pub strategic_importance: StrategicMultipliers,
    pub stakeholder: StakeholderMultipliers,
    pub high_impact_type_multiplier: f64,
}

impl Default for ImpactTables {
    fn default() -> Self {
        Self {
            base: 0.5,
            client_tier: ClientTierMultipliers::default(),
            strategic_importance: StrategicMultipliers::default(),
            stakeholder: StakeholderMultipliers::default(),
            high_impact_type_multiplier: 1.3,
        }
    }
}

impl ImpactTables {
    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            self.base,
            self.high_impact_type_multiplier,
            self.client_tier.enterprise,
            self.client_tier.premium,
            self.client_tier.standard,
            self.client_tier.basic,
            self.strategic_importance.critical,
            self.strategic_importance.high,
            self.strategic_importance.medium,
            self.strategic_importance.low,
            self.stakeholder.ceo,
            self.stakeholder.executive,
            self.stakeholder.manager,
            self.stakeholder.team,
        ];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::setting(
                "scoring.impact",
                "multipliers must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTierMultipliers {
    pub enterprise: f64,
    pub premium: f64,
    pub standard: f64,
    pub basic: f64,
}

impl Default for ClientTierMultipliers {
    fn default() -> Self {
        Self {
            enterprise: 1.5,
            premium: 1.2,
            standard: 1.0,
            basic: 0.8,
        }
    }
}

impl ClientTierMultipliers {
    pub fn get(&self, tier: ClientTier) -> f64 {
        match tier {
            ClientTier::Enterprise => self.enterprise,
            ClientTier::Premium => self.premium,
            ClientTier::Standard => self.standard,
            ClientTier::Basic => self.basic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategicMultipliers {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for StrategicMultipliers {
    fn default() -> Self {
        Self {
            critical: 2.0,
            high: 1.5,
            medium: 1.0,
            low: 0.5,
        }
    }
}

impl StrategicMultipliers {
    pub fn get(&self, importance: StrategicImportance) -> f64 {
        match importance {
            StrategicImportance::Critical => self.critical,
            StrategicImportance::High => self.high,
            StrategicImportance::Medium => self.medium,
            StrategicImportance::Low => self.low,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeholderMultipliers {
    pub ceo: f64,
    pub executive: f64,
    pub manager: f64,
    pub team: f64,
}

impl Default for StakeholderMultipliers {
    fn default() -> Self {
        Self {
            ceo: 2.0,
            executive: 1.5,
            manager: 1.0,
            team: 0.8,
        }
    }
}

impl StakeholderMultipliers {
    pub fn get(&self, level: StakeholderLevel) -> f64 {
        match level {
            StakeholderLevel::Ceo => self.ceo,
            StakeholderLevel::Executive => self.executive,
            StakeholderLevel::Manager => self.manager,
            StakeholderLevel::Team => self.team,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Largest relative shift the performance history may apply to a score.
    pub max_performance_shift: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_performance_shift: 0.15,
        }
    }
}

impl MatchingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_performance_shift) {
            return Err(ConfigError::setting(
                "matching.max_performance_shift",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub rebalance_interval_secs: u64,
    /// Enqueues since the last rebalance that force an early one.
    pub burst_threshold: usize,
    /// Time a task may wait without any qualified worker before escalation.
    pub max_starvation_wait_secs: u64,
    /// Hand a worker the best task it does not fully qualify for when
    /// nothing else is available.
    pub allow_unqualified_fallback: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_secs: 60,
            burst_threshold: 50,
            max_starvation_wait_secs: 600,
            allow_unqualified_fallback: false,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rebalance_interval_secs == 0 {
            return Err(ConfigError::setting("queue.rebalance_interval_secs", "must be > 0"));
        }
        if self.burst_threshold == 0 {
            return Err(ConfigError::setting("queue.burst_threshold", "must be > 0"));
        }
        Ok(())
    }

    pub fn rebalance_interval(&self) -> TimeDelta {
        secs_delta(self.rebalance_interval_secs)
    }

    pub fn max_starvation_wait(&self) -> TimeDelta {
        secs_delta(self.max_starvation_wait_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Cadence of the batch pass run by the maintenance loop.
    pub interval_secs: u64,
    /// Wall-clock budget for one solve.
    pub time_budget_ms: u64,
    /// Edge relaxations allowed for one solve.
    pub max_iterations: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            time_budget_ms: 50,
            max_iterations: 2_000_000,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::setting("optimizer.interval_secs", "must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::setting("optimizer.max_iterations", "must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> TimeDelta {
        secs_delta(self.interval_secs)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Smoothing factor of the load estimate, within (0, 1].
    pub ewma_alpha: f64,
    /// Overall utilization that triggers an out-of-cycle rebalance.
    pub high_water_mark: f64,
    /// Records kept in each worker's performance window.
    pub history_window: usize,
    /// Silence after which a worker is treated as offline.
    pub heartbeat_timeout_ms: u64,
    /// Recent assignments kept for the status view.
    pub assignment_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.5,
            high_water_mark: 0.85,
            history_window: 20,
            heartbeat_timeout_ms: 30_000,
            assignment_history: 1000,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::setting("monitor.ewma_alpha", "must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.high_water_mark) {
            return Err(ConfigError::setting("monitor.high_water_mark", "must be within [0, 1]"));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::setting("monitor.heartbeat_timeout_ms", "must be > 0"));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Automated retries allowed for transient failures.
    pub max_retries: u32,
    /// Closed failure records and escalations kept for queries; older
    /// ones are dropped first.
    pub record_retention: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            record_retention: 1_000,
        }
    }
}

fn secs_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
