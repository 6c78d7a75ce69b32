use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, anyhow};
use comms::specs::{Sample, StrategySpec};
use orchestrator::{BenchmarkConfig, WorldSpec};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cli::Args;

/// Everything a rank needs besides its own rank, loaded from the command line and the
/// configuration files it names.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub config: BenchmarkConfig,
    pub model: StrategySpec,
    pub data: StrategySpec,
}

impl Inputs {
    /// Builds the dataset, seeded from the run's seed unless its entry names one.
    pub fn dataset(&self) -> Result<Vec<Sample>> {
        let mut spec = self.data.clone();
        seed_if_missing(&mut spec, self.config.seed);
        Ok(strategies::build_dataset(&spec)?)
    }
}

/// A data or model entry: the registry key plus its constructor arguments.
#[derive(Debug, Deserialize)]
struct ClassEntry {
    #[serde(alias = "data_class", alias = "model_class")]
    class: String,
    #[serde(default)]
    configurations: Value,
}

impl Args {
    /// Loads and validates every input of the run.
    ///
    /// # Errors
    /// Fails if a file cannot be read, an id is missing or the configuration is invalid.
    pub fn load(&self) -> Result<Inputs> {
        let world = WorldSpec::new(
            self.ntrainer,
            self.ncudatrainer,
            self.nserver,
            self.ncudaserver,
        )?;

        let trainer = StrategySpec::with_params(
            &self.trainer,
            strategy_params(self.trainer_config_path.as_deref(), &self.trainer)?,
        );

        let server = match &self.server {
            Some(kind) => StrategySpec::with_params(
                kind,
                strategy_params(self.server_config_path.as_deref(), kind)?,
            ),
            None => StrategySpec::new(""),
        };

        let config = BenchmarkConfig {
            world,
            trainer,
            server,
            backend: self.backend.clone(),
            filestore: self.filestore.clone(),
            epochs: self.epochs,
            batch_size: self.batch_size,
            rpc_timeout: Duration::from_secs(self.rpc_timeout),
            seed: self.seed,
        };
        config.validate()?;

        let model = class_spec(&self.model_config_path, &self.model)?;
        let data = class_spec(&self.data_config_path, &self.data)?;

        Ok(Inputs {
            config,
            model,
            data,
        })
    }
}

/// Reads entry `id` of a JSON object file.
fn entry(path: &Path, id: &str) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut entries: Map<String, Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON object", path.display()))?;

    entries
        .remove(id)
        .ok_or_else(|| anyhow!("no entry {id:?} in {}", path.display()))
}

/// Trainer and server files map a registry key straight to its parameters.
fn strategy_params(path: Option<&Path>, kind: &str) -> Result<Value> {
    match path {
        Some(path) => entry(path, kind),
        None => Ok(Value::Null),
    }
}

fn class_spec(path: &Path, id: &str) -> Result<StrategySpec> {
    let entry: ClassEntry = serde_json::from_value(entry(path, id)?)
        .with_context(|| format!("malformed entry {id:?} in {}", path.display()))?;

    Ok(StrategySpec::with_params(entry.class, entry.configurations))
}

fn seed_if_missing(spec: &mut StrategySpec, seed: u64) {
    if spec.params.is_null() {
        spec.params = Value::Object(Map::new());
    }

    if let Value::Object(params) = &mut spec.params {
        params.entry("seed").or_insert_with(|| seed.into());
    }
}
