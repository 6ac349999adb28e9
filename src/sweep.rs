//! Batch parameter sweeps.
//!
//! Every instance owns a fresh engine, so instances run in parallel and a
//! failing instance never affects the others.

use crate::config::Config;
use crate::engine::{Engine, Outcome};
use crate::manager::run_params;
use crate::metrics::{self, TickMetrics};
use crate::model::Status;
use crate::stats::Accumulator;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::io::Write;

/// One simulation of the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub run: usize,
    pub point: usize,
    pub iteration: usize,
    pub preference_weight: f64,
    pub income_variance: f64,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub outcome: Outcome,
    pub rows: Vec<TickMetrics>,
}

#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub instance: Instance,
    pub result: Result<RunRecord, String>,
}

/// Expand the sweep into instances, iterations innermost.
pub fn instances(cfg: &Config) -> Result<Vec<Instance>> {
    let sweep = cfg.sweep.as_ref().context("config has no [sweep] table")?;

    let mut out = Vec::new();
    let mut point = 0;
    for &preference_weight in &sweep.preference_weight {
        for &income_variance in &sweep.income_variance {
            for iteration in 0..sweep.iterations {
                out.push(Instance {
                    run: out.len(),
                    point,
                    iteration,
                    preference_weight,
                    income_variance,
                });
            }
            point += 1;
        }
    }
    Ok(out)
}

/// Configuration of a single instance.
///
/// With a base seed set, instance `n` uses `seed + n`.
pub fn instance_config(cfg: &Config, instance: &Instance) -> Config {
    let mut inst_cfg = cfg.with_point(instance.preference_weight, instance.income_variance);
    inst_cfg.run.seed = cfg.run.seed.map(|seed| seed.wrapping_add(instance.run as u64));
    inst_cfg.run.snapshot_every = 0;
    inst_cfg
}

fn run_instance(cfg: &Config, instance: &Instance) -> Result<RunRecord> {
    let mut engine =
        Engine::new(instance_config(cfg, instance)).context("failed to initialize engine")?;
    let outcome = engine.run(None)?;
    Ok(RunRecord {
        outcome,
        rows: engine.metrics().records().to_vec(),
    })
}

/// Run every instance of the sweep.
pub fn run_sweep(cfg: &Config) -> Result<Vec<InstanceResult>> {
    let instances = instances(cfg)?;
    log::info!("running {} sweep instances", instances.len());

    let results = instances
        .into_par_iter()
        .map(|instance| {
            let result = run_instance(cfg, &instance).map_err(|error| {
                log::warn!("instance {} failed: {error:#}", instance.run);
                format!("{error:#}")
            });
            InstanceResult { instance, result }
        })
        .collect::<Vec<_>>();

    let failed = results.iter().filter(|res| res.result.is_err()).count();
    log::info!("sweep finished: {failed} of {} instances failed", results.len());
    Ok(results)
}

/// Per-tick rows of every successful instance.
pub fn write_rows<W: Write>(
    writer: &mut W,
    cfg: &Config,
    results: &[InstanceResult],
) -> Result<()> {
    metrics::write_header(writer)?;
    for res in results {
        if let Ok(record) = &res.result {
            let inst_cfg = instance_config(cfg, &res.instance);
            let params = run_params(&inst_cfg, res.instance.run, &record.outcome);
            metrics::write_rows(writer, &params, &record.rows)?;
        }
    }
    Ok(())
}

/// One row per sweep point with statistics over its iterations.
pub fn write_summary<W: Write>(writer: &mut W, results: &[InstanceResult]) -> Result<()> {
    writeln!(
        writer,
        "preference_weight,income_variance,runs,failed,converged,\
ticks_mean,ticks_std,fraction_happy_mean,fraction_happy_std,\
segregation_index_mean,segregation_index_std,first_error"
    )?;

    let n_points = results.iter().map(|res| res.instance.point + 1).max().unwrap_or(0);
    for point in 0..n_points {
        let group: Vec<_> = results
            .iter()
            .filter(|res| res.instance.point == point)
            .collect();
        let Some(first) = group.first() else {
            continue;
        };

        let mut ticks = Accumulator::new();
        let mut happy = Accumulator::new();
        let mut segregation = Accumulator::new();
        let mut converged = 0;
        let mut failed = 0;
        let mut first_error = String::new();

        for res in &group {
            match &res.result {
                Ok(record) => {
                    ticks.add(record.outcome.ticks as f64);
                    if record.outcome.status == Status::Converged {
                        converged += 1;
                    }
                    if let Some(last) = record.rows.last() {
                        happy.add(last.fraction_happy);
                        segregation.add(last.segregation_index);
                    }
                }
                Err(error) => {
                    failed += 1;
                    if first_error.is_empty() {
                        first_error = error.replace([',', '\n'], " ");
                    }
                }
            }
        }

        let ticks = ticks.summary();
        let happy = happy.summary();
        let segregation = segregation.summary();
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            first.instance.preference_weight,
            first.instance.income_variance,
            group.len(),
            failed,
            converged,
            ticks.mean,
            ticks.std_dev,
            happy.mean,
            happy.std_dev,
            segregation.mean,
            segregation.std_dev,
            first_error,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SweepConfig, tests::basic};

    fn sweep_config() -> Config {
        let mut cfg = basic();
        cfg.grid.width = 8;
        cfg.grid.height = 8;
        cfg.grid.center = [4, 4];
        cfg.run.max_ticks = 15;
        cfg.sweep = Some(SweepConfig {
            preference_weight: vec![0.0, 1.0],
            income_variance: vec![0.1, 0.5],
            iterations: 2,
        });
        cfg
    }

    #[test]
    fn expands_cartesian_product() {
        let list = instances(&sweep_config()).unwrap();
        assert_eq!(list.len(), 8);
        assert_eq!(list[3].point, 1);
        assert_eq!(list[3].iteration, 1);
        assert_eq!(list[3].preference_weight, 0.0);
        assert_eq!(list[3].income_variance, 0.5);
        assert_eq!(list[7].run, 7);
        assert_eq!(list[7].point, 3);
    }

    #[test]
    fn instance_seeds_are_offset() {
        let cfg = sweep_config();
        let list = instances(&cfg).unwrap();
        let inst_cfg = instance_config(&cfg, &list[5]);
        assert_eq!(inst_cfg.run.seed, Some(12));
        assert!(inst_cfg.sweep.is_none());
    }

    #[test]
    fn missing_sweep_table_is_an_error() {
        assert!(run_sweep(&basic()).is_err());
    }

    #[test]
    fn failing_instances_do_not_abort_the_sweep() {
        let mut cfg = sweep_config();
        // Bypasses load-time validation so one point fails at engine setup.
        cfg.sweep = Some(SweepConfig {
            preference_weight: vec![0.5, 1.5],
            income_variance: vec![0.25],
            iterations: 2,
        });

        let results = run_sweep(&cfg).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_ok());
        assert!(results[2].result.is_err());
        assert!(results[3].result.is_err());

        let mut out = Vec::new();
        write_summary(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0.5,0.25,2,0,"));
        assert!(lines[2].starts_with("1.5,0.25,2,2,0,"));
        assert!(lines[2].contains("preference_weight"));
    }

    #[test]
    fn rows_cover_every_tick_of_every_run() {
        let cfg = sweep_config();
        let results = run_sweep(&cfg).unwrap();
        let expected: usize = results
            .iter()
            .map(|res| res.result.as_ref().unwrap().rows.len())
            .sum();

        let mut out = Vec::new();
        write_rows(&mut out, &cfg, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), expected + 1);
    }
}
