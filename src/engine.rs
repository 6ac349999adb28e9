use crate::config::Config;
use crate::error::SimError;
use crate::grid::Grid;
use crate::metrics::MetricsCollector;
use crate::model::{Agent, AgentKind, CellView, OccupantView, Position, Snapshot, Status};
use crate::utility::UtilityEngine;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Bernoulli, LogNormal, Uniform};
use serde::{Deserialize, Serialize};

/// Receives grid snapshots between ticks.
///
/// Observers only ever see an immutable [`Snapshot`]; they cannot change the run.
pub trait Observer {
    /// Whether a snapshot should be built for `tick`.
    fn wants(&self, _tick: usize) -> bool {
        true
    }

    fn observe(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// How a finished run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    pub ticks: usize,
    pub seed: u64,
}

/// Samples new agents from the configured distributions.
struct Population {
    resident: LogNormal<f64>,
    immigrant: LogNormal<f64>,
    threshold: Uniform<f64>,
    preference_weight: f64,
    resident_sensitivity: f64,
    immigrant_sensitivity: f64,
}

impl Population {
    fn new(cfg: &Config) -> Result<Self, SimError> {
        let agents = &cfg.agents;
        let resident =
            LogNormal::from_mean_cv(agents.resident.income_mean, agents.resident.income_variance)
                .map_err(|e| SimError::config("agents.resident", e.to_string()))?;
        let immigrant = LogNormal::from_mean_cv(
            agents.immigrant.income_mean,
            agents.immigrant.income_variance,
        )
        .map_err(|e| SimError::config("agents.immigrant", e.to_string()))?;
        let threshold = &agents.threshold;
        let threshold = Uniform::new_inclusive(threshold.init_min, threshold.init_max)
            .map_err(|e| SimError::config("agents.threshold", e.to_string()))?;

        Ok(Self {
            resident,
            immigrant,
            threshold,
            preference_weight: cfg.model.preference_weight,
            resident_sensitivity: agents.resident.threshold_sensitivity,
            immigrant_sensitivity: agents.immigrant.threshold_sensitivity,
        })
    }

    fn spawn<R: Rng>(&self, kind: AgentKind, rng: &mut R) -> Agent {
        let (income, sensitivity) = match kind {
            AgentKind::Resident => (self.resident.sample(rng), self.resident_sensitivity),
            AgentKind::Immigrant => (self.immigrant.sample(rng), self.immigrant_sensitivity),
        };
        let threshold = self.threshold.sample(rng);
        Agent::new(kind, income, self.preference_weight, sensitivity, threshold)
    }
}

/// Simulation engine.
///
/// Owns the grid, the random source and the run state, and advances the
/// model one tick at a time.
pub struct Engine {
    cfg: Config,
    seed: u64,
    grid: Grid,
    utility: UtilityEngine,
    population: Population,
    rng: ChaCha12Rng,
    tick: usize,
    status: Status,
    all_happy: bool,
    order: Vec<usize>,
    moved: Vec<bool>,
    metrics: MetricsCollector,
}

impl Engine {
    /// Create an `Engine` with agents placed at random according to `cfg`.
    pub fn new(cfg: Config) -> Result<Self, SimError> {
        cfg.validate()?;
        let seed = cfg.run.seed.unwrap_or_else(fresh_seed);
        let mut rng = ChaCha12Rng::seed_from_u64(seed);

        let population = Population::new(&cfg)?;
        let occupied_dist = Bernoulli::new(cfg.grid.density)
            .map_err(|e| SimError::config("grid.density", e.to_string()))?;
        let immigrant_dist = Bernoulli::new(cfg.agents.immigrant_fraction)
            .map_err(|e| SimError::config("agents.immigrant_fraction", e.to_string()))?;

        let mut grid = empty_grid(&cfg)?;
        for row in 0..cfg.grid.height {
            for col in 0..cfg.grid.width {
                if !occupied_dist.sample(&mut rng) {
                    continue;
                }
                let kind = if immigrant_dist.sample(&mut rng) {
                    AgentKind::Immigrant
                } else {
                    AgentKind::Resident
                };
                grid.place(population.spawn(kind, &mut rng), (row, col))?;
            }
        }

        Self::assemble(cfg, grid, seed, rng, population)
    }

    /// Create an `Engine` around an already populated grid.
    #[cfg(test)]
    pub fn from_grid(cfg: Config, grid: Grid) -> Result<Self, SimError> {
        cfg.validate()?;
        let seed = cfg.run.seed.unwrap_or_else(fresh_seed);
        let rng = ChaCha12Rng::seed_from_u64(seed);
        let population = Population::new(&cfg)?;
        Self::assemble(cfg, grid, seed, rng, population)
    }

    fn assemble(
        cfg: Config,
        mut grid: Grid,
        seed: u64,
        rng: ChaCha12Rng,
        population: Population,
    ) -> Result<Self, SimError> {
        if grid.width() != cfg.grid.width || grid.height() != cfg.grid.height {
            return Err(SimError::config(
                "grid",
                "grid dimensions differ from the configuration",
            ));
        }
        if grid.center() != (cfg.grid.center[0], cfg.grid.center[1]) {
            return Err(SimError::config(
                "grid.center",
                "grid center differs from the configuration",
            ));
        }

        grid.reset_quality();
        let utility = UtilityEngine::new(cfg.grid.radius);
        let mut metrics = MetricsCollector::new(cfg.model.slum_quality);
        let initial = metrics.sample(0, &grid, &utility, 0)?;
        let all_happy = initial.happy == initial.agents;

        Ok(Self {
            order: Vec::with_capacity(grid.agents().len()),
            moved: Vec::new(),
            cfg,
            seed,
            grid,
            utility,
            population,
            rng,
            tick: 0,
            status: Status::Running,
            all_happy,
            metrics,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn tick(&self) -> usize {
        self.tick
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn outcome(&self) -> Outcome {
        Outcome {
            status: self.status,
            ticks: self.tick,
            seed: self.seed,
        }
    }

    /// Run until convergence or the tick limit.
    ///
    /// The observer, if any, is offered a snapshot after placement and after
    /// every tick.
    pub fn run(&mut self, mut observer: Option<&mut dyn Observer>) -> Result<Outcome> {
        log::info!(
            "starting run: seed {}, {} agents on {}x{}",
            self.seed,
            self.grid.agents().len(),
            self.grid.width(),
            self.grid.height()
        );

        self.notify(&mut observer)?;
        while !self.status.is_terminal() {
            self.step().context("simulation aborted")?;
            self.notify(&mut observer)?;

            if self.tick % 100 == 0 {
                let progress = 100.0 * self.tick as f64 / self.cfg.run.max_ticks as f64;
                log::info!("completed {progress:06.2}% of tick budget");
            }
        }

        log::info!(
            "run finished: {} after {} ticks",
            self.status.as_str(),
            self.tick
        );
        Ok(self.outcome())
    }

    fn notify(&self, observer: &mut Option<&mut dyn Observer>) -> Result<()> {
        if let Some(observer) = observer.as_mut() {
            if observer.wants(self.tick) || self.status.is_terminal() {
                let snapshot = self.snapshot().context("failed to build snapshot")?;
                observer.observe(&snapshot).context("observer failed")?;
            }
        }
        Ok(())
    }

    /// Advance the model by one tick and return the resulting status.
    ///
    /// Agents are activated one at a time in a fresh random order, so each
    /// agent sees the moves made earlier in the same tick. A terminal engine
    /// is left untouched.
    pub fn step(&mut self) -> Result<Status, SimError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        self.tick += 1;
        self.admit_arrivals()?;
        self.moved.clear();
        self.moved.resize(self.grid.agents().len(), false);

        let mut order = std::mem::take(&mut self.order);
        order.clear();
        order.extend(0..self.grid.agents().len());
        order.shuffle(&mut self.rng);

        let mut moves = 0;
        for &id in &order {
            if self.activate(id)? {
                moves += 1;
            }
        }
        self.order = order;
        debug_assert!(self.grid.check_occupancy());

        self.grid.refresh_all_quality();

        let record = self
            .metrics
            .sample(self.tick, &self.grid, &self.utility, moves)?;
        self.all_happy = record.happy == record.agents;
        log::debug!(
            "tick {}: {} moves, {:.3} happy",
            self.tick,
            moves,
            record.fraction_happy
        );

        self.status = if self.all_happy {
            Status::Converged
        } else if self.tick >= self.cfg.run.max_ticks {
            Status::MaxStepsReached
        } else {
            Status::Running
        };
        Ok(self.status)
    }

    /// Let one agent reconsider its location, then adapt its threshold.
    ///
    /// Returns whether the agent moved.
    fn activate(&mut self, id: usize) -> Result<bool, SimError> {
        let current = self.utility.current(&self.grid, id)?;
        let threshold = self.grid.agent(id)?.threshold();

        let mut moved = false;
        let mut utility = current;
        if current < threshold {
            if let Some((target, value)) = self.best_site(id, current)? {
                log::trace!("agent {id} moves to {target:?} ({current:.3} -> {value:.3})");
                self.grid.relocate(id, target)?;
                if let Some(flag) = self.moved.get_mut(id) {
                    *flag = true;
                }
                moved = true;
                utility = value;
            }
        }

        let happy = utility >= threshold;
        let model = &self.cfg.model;
        self.grid
            .agent_mut(id)?
            .adapt_threshold(happy, model.delta_up, model.delta_down);
        Ok(moved)
    }

    /// Best affordable vacant site with utility strictly above `current`.
    ///
    /// When there are more vacancies than `max_candidates`, a uniform sample
    /// of that size is scored instead. Ties keep the first candidate found.
    fn best_site(
        &mut self,
        id: usize,
        current: f64,
    ) -> Result<Option<(Position, f64)>, SimError> {
        let mut candidates = self.grid.vacant_cells();
        let cap = self.cfg.model.max_candidates;
        if candidates.len() > cap {
            candidates = candidates
                .choose_multiple(&mut self.rng, cap)
                .copied()
                .collect();
        }

        let mut best = None;
        let mut best_value = current;
        for pos in candidates {
            if !self.affordable(id, pos)? {
                continue;
            }
            let value = self.utility.utility(&self.grid, id, pos)?;
            if value > best_value {
                best = Some(pos);
                best_value = value;
            }
        }
        Ok(best.map(|pos| (pos, best_value)))
    }

    /// Whether agent `id` can pay the rent of the site at `pos`.
    fn affordable(&self, id: usize, pos: Position) -> Result<bool, SimError> {
        let Some(rent_ratio) = self.cfg.model.rent_ratio else {
            return Ok(true);
        };
        let rent = self.grid.site(pos)?.quality() * rent_ratio * self.cfg.model.income_scale;
        Ok(rent <= self.grid.agent(id)?.income())
    }

    fn admit_arrivals(&mut self) -> Result<(), SimError> {
        let Some(arrivals) = &self.cfg.arrivals else {
            return Ok(());
        };
        if arrivals.start_tick != self.tick {
            return Ok(());
        }

        let count = arrivals.count;
        let vacant = self.grid.vacant_cells();
        if vacant.len() < count {
            log::warn!(
                "only {} vacant cells for {} arriving immigrants",
                vacant.len(),
                count
            );
        }
        let sites: Vec<Position> = vacant
            .choose_multiple(&mut self.rng, count)
            .copied()
            .collect();
        for &pos in &sites {
            let agent = self.population.spawn(AgentKind::Immigrant, &mut self.rng);
            self.grid.place(agent, pos)?;
        }
        log::info!("tick {}: {} immigrants arrived", self.tick, sites.len());
        Ok(())
    }

    /// Read-only view of the whole grid at the current tick.
    pub fn snapshot(&self) -> Result<Snapshot, SimError> {
        let mut cells = Vec::with_capacity(self.grid.width() * self.grid.height());
        for site in self.grid.sites() {
            let pos = site.pos();
            let occupant = match self.grid.occupant_id(pos)? {
                Some(id) => {
                    let agent = self.grid.agent(id)?;
                    let utility = self.utility.current(&self.grid, id)?;
                    Some(OccupantView {
                        id,
                        kind: agent.kind(),
                        income: agent.income(),
                        threshold: agent.threshold(),
                        utility,
                        happy: agent.is_happy(utility),
                        moved: self.moved.get(id).copied().unwrap_or(false),
                    })
                }
                None => None,
            };
            cells.push(CellView {
                row: pos.0,
                col: pos.1,
                quality: site.quality(),
                is_center: site.is_center(),
                occupant,
            });
        }

        Ok(Snapshot {
            tick: self.tick,
            status: self.status,
            width: self.grid.width(),
            height: self.grid.height(),
            cells,
        })
    }
}

/// Fresh seeds stay within 32 bits so they fit back into a TOML config.
fn fresh_seed() -> u64 {
    rand::rng().random::<u32>() as u64
}

fn empty_grid(cfg: &Config) -> Result<Grid, SimError> {
    Grid::new(
        cfg.grid.width,
        cfg.grid.height,
        (cfg.grid.center[0], cfg.grid.center[1]),
        cfg.model.quality_smoothing,
        cfg.model.income_scale,
    )
}
