use crate::error::SimError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub grid: GridConfig,
    pub agents: AgentsConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub arrivals: Option<ArrivalsConfig>,
    pub run: RunConfig,
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
}

/// City layout.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
    /// City center as `[row, col]`.
    pub center: [usize; 2],
    /// Probability that a cell starts occupied.
    pub density: f64,
    /// Moore neighbourhood radius used for homophily.
    #[serde(default = "default_radius")]
    pub radius: usize,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    /// Fraction of initial agents that are immigrants.
    pub immigrant_fraction: f64,
    pub resident: KindConfig,
    pub immigrant: KindConfig,
    pub threshold: ThresholdConfig,
}

/// Per-type agent parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindConfig {
    /// Mean of the log-normal income distribution.
    pub income_mean: f64,
    /// Coefficient of variation of the income distribution.
    pub income_variance: f64,
    /// Multiplier applied to both threshold adaptation rates.
    #[serde(default = "default_sensitivity")]
    pub threshold_sensitivity: f64,
}

/// Initial happiness thresholds are drawn uniformly from `[init_min, init_max]`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdConfig {
    pub init_min: f64,
    pub init_max: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Weight of the homophily term; the travel term gets the remainder.
    pub preference_weight: f64,
    /// Threshold increase after a happy tick.
    pub delta_up: f64,
    /// Threshold decrease after an unhappy tick.
    pub delta_down: f64,
    /// Smoothing factor of the site quality moving average.
    #[serde(default = "default_quality_smoothing")]
    pub quality_smoothing: f64,
    /// Income that maps to a site quality of 1.
    #[serde(default = "default_income_scale")]
    pub income_scale: f64,
    /// Sites below this quality count as slums.
    #[serde(default = "default_slum_quality")]
    pub slum_quality: f64,
    /// Rent per unit of quality as a fraction of `income_scale`.
    /// `None` makes every vacant site affordable.
    #[serde(default)]
    pub rent_ratio: Option<f64>,
    /// Largest number of vacant sites scored per relocation search.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

/// A single wave of immigrants entering the city.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArrivalsConfig {
    pub start_tick: usize,
    pub count: usize,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub max_ticks: usize,
    /// Seed of the random source; omitted means a fresh seed per run.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Ticks between trajectory snapshots (0 disables them).
    #[serde(default)]
    pub snapshot_every: usize,
}

/// Batch sweep over the preference weight and the income variance.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub preference_weight: Vec<f64>,
    pub income_variance: Vec<f64>,
    pub iterations: usize,
}

fn default_radius() -> usize {
    1
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_quality_smoothing() -> f64 {
    0.1
}

fn default_income_scale() -> f64 {
    50_000.0
}

fn default_slum_quality() -> f64 {
    0.2
}

fn default_max_candidates() -> usize {
    256
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::parse(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;
        config.validate().context("failed to validate config")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let grid = &self.grid;
        check_num("grid.width", grid.width, 1..=10_000)?;
        check_num("grid.height", grid.height, 1..=10_000)?;
        check_num("grid.center[0]", grid.center[0], 0..grid.height)?;
        check_num("grid.center[1]", grid.center[1], 0..grid.width)?;
        check_num("grid.density", grid.density, 0.0..=1.0)?;
        check_num("grid.radius", grid.radius, 1..=grid.width.max(grid.height))?;

        let agents = &self.agents;
        check_num("agents.immigrant_fraction", agents.immigrant_fraction, 0.0..=1.0)?;
        check_kind("agents.resident", &agents.resident)?;
        check_kind("agents.immigrant", &agents.immigrant)?;
        check_num("agents.threshold.init_min", agents.threshold.init_min, 0.0..=1.0)?;
        check_num(
            "agents.threshold.init_max",
            agents.threshold.init_max,
            agents.threshold.init_min..=1.0,
        )?;

        let model = &self.model;
        check_num("model.preference_weight", model.preference_weight, 0.0..=1.0)?;
        check_num("model.delta_up", model.delta_up, 0.0..=1.0)?;
        check_num("model.delta_down", model.delta_down, 0.0..=1.0)?;
        check_num("model.quality_smoothing", model.quality_smoothing, f64::EPSILON..=1.0)?;
        check_num("model.income_scale", model.income_scale, f64::EPSILON..=1e12)?;
        check_num("model.slum_quality", model.slum_quality, 0.0..=1e6)?;
        if let Some(rent_ratio) = model.rent_ratio {
            check_num("model.rent_ratio", rent_ratio, 0.0..=1e6)?;
        }
        check_num("model.max_candidates", model.max_candidates, 1..)?;

        if let Some(arrivals) = &self.arrivals {
            check_num("arrivals.start_tick", arrivals.start_tick, 1..=self.run.max_ticks)?;
            check_num("arrivals.count", arrivals.count, 1..=grid.width * grid.height)?;
        }

        check_num("run.max_ticks", self.run.max_ticks, 1..=1_000_000)?;

        if let Some(sweep) = &self.sweep {
            if sweep.preference_weight.is_empty() {
                return Err(SimError::config("sweep.preference_weight", "list is empty"));
            }
            if sweep.income_variance.is_empty() {
                return Err(SimError::config("sweep.income_variance", "list is empty"));
            }
            for &weight in &sweep.preference_weight {
                check_num("sweep.preference_weight", weight, 0.0..=1.0)?;
            }
            for &variance in &sweep.income_variance {
                check_num("sweep.income_variance", variance, 0.0..=10.0)?;
            }
            check_num("sweep.iterations", sweep.iterations, 1..=10_000)?;
        }

        Ok(())
    }

    /// Copy of this configuration with one sweep point applied.
    ///
    /// The income variance is applied to both agent types.
    pub fn with_point(&self, preference_weight: f64, income_variance: f64) -> Self {
        let mut cfg = self.clone();
        cfg.model.preference_weight = preference_weight;
        cfg.agents.resident.income_variance = income_variance;
        cfg.agents.immigrant.income_variance = income_variance;
        cfg.sweep = None;
        cfg
    }
}

fn check_kind(prefix: &str, kind: &KindConfig) -> Result<(), SimError> {
    check_num(
        &format!("{prefix}.income_mean"),
        kind.income_mean,
        f64::EPSILON..=1e12,
    )?;
    check_num(
        &format!("{prefix}.income_variance"),
        kind.income_variance,
        0.0..=10.0,
    )?;
    check_num(
        &format!("{prefix}.threshold_sensitivity"),
        kind.threshold_sensitivity,
        0.0..=10.0,
    )?;
    Ok(())
}

fn check_num<T, R>(field: &str, num: T, range: R) -> Result<(), SimError>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        return Err(SimError::config(
            field,
            format!("number must be in the range {range:?}, but is {num:?}"),
        ));
    }
    Ok(())
}
