use crate::error::SimError;
use crate::grid::Grid;
use crate::model::AgentKind;
use crate::utility::UtilityEngine;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Aggregate statistics of the grid at the end of a tick.
///
/// Means over an empty set are `NaN`. With no agents, `fraction_happy` is 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMetrics {
    pub tick: usize,
    pub agents: usize,
    pub happy: usize,
    pub fraction_happy: f64,
    pub mean_utility: f64,
    pub mean_utility_resident: f64,
    pub mean_utility_immigrant: f64,
    /// Mean same-type fraction over agents with at least one occupied neighbour.
    pub segregation_index: f64,
    pub mean_income: f64,
    pub slum_count: usize,
    pub moves: usize,
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn add(&mut self, val: f64) {
        self.sum += val;
        self.n += 1;
    }

    fn value(&self) -> f64 {
        if self.n == 0 {
            return f64::NAN;
        }
        self.sum / self.n as f64
    }
}

/// Collects one [`TickMetrics`] record per tick.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    slum_quality: f64,
    records: Vec<TickMetrics>,
}

impl MetricsCollector {
    pub fn new(slum_quality: f64) -> Self {
        Self {
            slum_quality,
            records: Vec::new(),
        }
    }

    /// Measure the grid and append a record for `tick`.
    pub fn sample(
        &mut self,
        tick: usize,
        grid: &Grid,
        utility: &UtilityEngine,
        moves: usize,
    ) -> Result<&TickMetrics, SimError> {
        let mut happy = 0;
        let mut all = Mean::default();
        let mut resident = Mean::default();
        let mut immigrant = Mean::default();
        let mut similarity = Mean::default();
        let mut income = Mean::default();

        for (id, agent) in grid.agents().iter().enumerate() {
            let value = utility.current(grid, id)?;
            if agent.is_happy(value) {
                happy += 1;
            }
            all.add(value);
            match agent.kind() {
                AgentKind::Resident => resident.add(value),
                AgentKind::Immigrant => immigrant.add(value),
            }
            income.add(agent.income());

            let (same, occupied) = grid.neighbor_counts(id, agent.pos(), utility.radius())?;
            if occupied > 0 {
                similarity.add(same as f64 / occupied as f64);
            }
        }

        let agents = grid.agents().len();
        let slum_count = grid
            .sites()
            .filter(|site| site.quality() < self.slum_quality)
            .count();

        self.records.push(TickMetrics {
            tick,
            agents,
            happy,
            fraction_happy: if agents == 0 {
                1.0
            } else {
                happy as f64 / agents as f64
            },
            mean_utility: all.value(),
            mean_utility_resident: resident.value(),
            mean_utility_immigrant: immigrant.value(),
            segregation_index: similarity.value(),
            mean_income: income.value(),
            slum_count,
            moves,
        });
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn records(&self) -> &[TickMetrics] {
        &self.records
    }
}

/// Run-level columns repeated on every exported row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub run: usize,
    pub preference_weight: f64,
    pub income_variance: f64,
    pub density: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub status: String,
}

const HEADER: &str = "run,preference_weight,income_variance,density,width,height,seed,status,\
tick,agents,happy,fraction_happy,mean_utility,mean_utility_resident,mean_utility_immigrant,\
segregation_index,mean_income,slum_count,moves";

pub fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writeln!(writer, "{HEADER}")?;
    Ok(())
}

/// Write one CSV row per tick, prefixed with the run parameters.
pub fn write_rows<W: Write>(
    writer: &mut W,
    params: &RunParams,
    rows: &[TickMetrics],
) -> Result<()> {
    for row in rows {
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            params.run,
            params.preference_weight,
            params.income_variance,
            params.density,
            params.width,
            params.height,
            params.seed,
            params.status,
            row.tick,
            row.agents,
            row.happy,
            row.fraction_happy,
            row.mean_utility,
            row.mean_utility_resident,
            row.mean_utility_immigrant,
            row.segregation_index,
            row.mean_income,
            row.slum_count,
            row.moves,
        )?;
    }
    Ok(())
}
