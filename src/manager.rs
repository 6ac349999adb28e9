use crate::config::Config;
use crate::engine::{Engine, Observer, Outcome};
use crate::metrics::{self, RunParams};
use crate::model::Snapshot;
use crate::sweep;
use anyhow::{Context, Result};
use glob::glob;
use rmp_serde::encode;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Streams snapshots into a MessagePack trajectory file.
struct TrajectoryWriter {
    writer: BufWriter<File>,
    every: usize,
}

impl TrajectoryWriter {
    fn create<P: AsRef<Path>>(file: P, every: usize) -> Result<Self> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        Ok(Self {
            writer: BufWriter::new(file),
            every,
        })
    }

    fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .context("failed to flush writer stream")
    }
}

impl Observer for TrajectoryWriter {
    fn wants(&self, tick: usize) -> bool {
        tick % self.every == 0
    }

    fn observe(&mut self, snapshot: &Snapshot) -> Result<()> {
        encode::write(&mut self.writer, snapshot).context("failed to serialize snapshot")
    }
}

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg = Config::from_file(sim_dir.join("config.toml"))
            .context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Perform one run in a new `run-NNNN` directory.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;
        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let mut engine = Engine::new(self.cfg.clone()).context("failed to initialize engine")?;

        let outcome = if self.cfg.run.snapshot_every > 0 {
            let every = self.cfg.run.snapshot_every;
            let mut writer = TrajectoryWriter::create(run_dir.join("trajectory.msgpack"), every)?;
            let outcome = engine
                .run(Some(&mut writer))
                .context("failed to run simulation")?;
            writer.finish()?;
            outcome
        } else {
            engine.run(None).context("failed to run simulation")?
        };
        log::info!(
            "seed {}: {} agents after {} ticks",
            engine.seed(),
            engine.grid().agents().len(),
            engine.tick()
        );

        let params = run_params(&self.cfg, run_idx, &outcome);
        let metrics_file = run_dir.join("metrics.csv");
        let file = File::create(&metrics_file)
            .with_context(|| format!("failed to create {metrics_file:?}"))?;
        let mut writer = BufWriter::new(file);
        metrics::write_header(&mut writer)?;
        metrics::write_rows(&mut writer, &params, engine.metrics().records())?;
        writer.flush().context("failed to flush writer stream")?;

        let summary_file = run_dir.join("summary.toml");
        let summary = toml::to_string(&outcome).context("failed to serialize outcome")?;
        fs::write(&summary_file, summary)
            .with_context(|| format!("failed to write {summary_file:?}"))?;

        Ok(())
    }

    /// Run the configured parameter sweep and export its tables.
    pub fn sweep_sim(&self) -> Result<()> {
        let results = sweep::run_sweep(&self.cfg).context("failed to run sweep")?;

        let rows_file = self.sim_dir.join("sweep.csv");
        let file =
            File::create(&rows_file).with_context(|| format!("failed to create {rows_file:?}"))?;
        let mut writer = BufWriter::new(file);
        sweep::write_rows(&mut writer, &self.cfg, &results)?;
        writer.flush().context("failed to flush writer stream")?;

        let summary_file = self.sim_dir.join("sweep-summary.csv");
        let file = File::create(&summary_file)
            .with_context(|| format!("failed to create {summary_file:?}"))?;
        let mut writer = BufWriter::new(file);
        sweep::write_summary(&mut writer, &results)?;
        writer.flush().context("failed to flush writer stream")?;

        log::info!("wrote {rows_file:?} and {summary_file:?}");
        Ok(())
    }

    /// Remove every generated output, keeping the configuration.
    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }
        for name in ["sweep.csv", "sweep-summary.csv"] {
            let file = self.sim_dir.join(name);
            if file.exists() {
                fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
                log::info!("removed {file:?}");
            }
        }
        Ok(())
    }

    fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }
}

/// Run-level export columns for a finished run.
pub fn run_params(cfg: &Config, run: usize, outcome: &Outcome) -> RunParams {
    RunParams {
        run,
        preference_weight: cfg.model.preference_weight,
        income_variance: cfg.agents.resident.income_variance,
        density: cfg.grid.density,
        width: cfg.grid.width,
        height: cfg.grid.height,
        seed: outcome.seed,
        status: outcome.status.as_str().to_string(),
    }
}
