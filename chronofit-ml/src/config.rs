//! Experiment configuration.
//!
//! `ExperimentConfig` is parsed from the command line with clap and resolved with
//! `figment` in layers: defaults -> optional TOML file -> `CHRONOFIT_*` environment
//! -> values given explicitly on the command line. After resolution the record is
//! read-only; the dataset provider may hand back an updated copy and the sweep
//! controller may override sampled fields, both through explicit calls.

use crate::error::MlError;
use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, Args, Parser, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prefix for environment variables that configure experiment fields.
pub const ENV_PREFIX: &str = "CHRONOFIT_";

/// Which model container the run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Direct multi-step forecaster.
    #[default]
    Forecast,
    /// Denoising-diffusion forecaster.
    Diffusion,
}

/// Forecasting task layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum Features {
    /// Multivariate in, multivariate out.
    #[default]
    #[value(name = "M")]
    #[serde(rename = "M")]
    Multivariate,
    /// Univariate in, univariate out.
    #[value(name = "S")]
    #[serde(rename = "S")]
    Univariate,
    /// Multivariate in, univariate out.
    #[value(name = "MS")]
    #[serde(rename = "MS")]
    MultiToUni,
}

/// Covariate encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CovariateType {
    Text,
    #[default]
    Tensor,
}

/// Boolean flag that accepts `0/1`, `true/false`, `yes/no` on the command line.
fn boolish() -> clap::builder::BoolishValueParser {
    clap::builder::BoolishValueParser::new()
}

/// Fully resolved hyperparameters for one run.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct ExperimentConfig {
    // --- basic config ---
    /// Number of devices (nodes) used by the trainer
    #[arg(long, default_value_t = 1)]
    pub num_nodes: usize,
    /// Task name: long_term_forecast, short_term_forecast, imputation, classification, anomaly_detection
    #[arg(long, default_value = "long_term_forecast")]
    pub task_name: String,
    /// Training status
    #[arg(long, default_value_t = 1)]
    pub is_training: i64,
    /// Model id
    #[arg(long, default_value = "test")]
    pub model_id: String,
    /// Prefix when saving test results
    #[arg(long, default_value = "none")]
    pub model_comment: String,
    /// Architecture name, used to namespace checkpoints
    #[arg(long, default_value = "Autoformer")]
    pub model: String,
    /// Model container to train
    #[arg(long, value_enum, default_value_t = ModelFamily::Forecast)]
    pub model_family: ModelFamily,
    /// Numeric precision: 32, 16-mixed, bf16-mixed, 64
    #[arg(long, default_value = "32")]
    pub precision: String,

    // --- data loader ---
    /// Dataset identifier
    #[arg(long, default_value = "ETTm1")]
    pub data_pretrain: String,
    /// Root path of the data file
    #[arg(long, default_value = "./dataset")]
    pub root_path: PathBuf,
    /// Data file
    #[arg(long, default_value = "ETTh1.csv")]
    pub data_path: String,
    /// Data file used for pretraining splits
    #[arg(long, default_value = "ETTh1.csv")]
    pub data_path_pretrain: String,
    /// Forecasting task: M, S or MS
    #[arg(long, value_enum, default_value_t = Features::Multivariate)]
    pub features: Features,
    /// Target feature in S or MS tasks
    #[arg(long, default_value = "OT")]
    pub target: String,
    /// Dataset loader: `synthetic`, anything else reads CSV
    #[arg(long, default_value = "modal")]
    pub loader: String,
    /// Frequency for time-feature encoding
    #[arg(long, default_value = "t")]
    pub freq: String,
    /// Location of model checkpoints
    #[arg(long, default_value = "./checkpoints")]
    pub checkpoints: PathBuf,
    /// Location of logs, checkpoints and tracker artifacts
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    // --- forecasting task ---
    /// Input sequence length
    #[arg(long, default_value_t = 96)]
    pub seq_len: usize,
    /// Start token length
    #[arg(long, default_value_t = 48)]
    pub label_len: usize,
    /// Prediction sequence length
    #[arg(long, default_value_t = 96)]
    pub pred_len: usize,
    /// Subset for M4
    #[arg(long, default_value = "Monthly")]
    pub seasonal_patterns: String,
    /// Stride in dataset construction
    #[arg(long, default_value_t = 8)]
    pub stride: usize,

    // --- model define ---
    /// Encoder input size
    #[arg(long, default_value_t = 3)]
    pub enc_in: usize,
    /// Decoder input size
    #[arg(long, default_value_t = 3)]
    pub dec_in: usize,
    /// Output size
    #[arg(long, default_value_t = 1)]
    pub c_out: usize,
    /// Dimension of model
    #[arg(long, default_value_t = 16)]
    pub d_model: usize,
    /// Number of heads
    #[arg(long, default_value_t = 8)]
    pub n_heads: usize,
    /// Number of encoder layers
    #[arg(long, default_value_t = 2)]
    pub e_layers: usize,
    /// Number of decoder layers
    #[arg(long, default_value_t = 1)]
    pub d_layers: usize,
    /// Dimension of fcn
    #[arg(long, default_value_t = 32)]
    pub d_ff: usize,
    /// Window size of moving average
    #[arg(long, default_value_t = 25)]
    pub moving_avg: usize,
    /// Attention factor
    #[arg(long, default_value_t = 1)]
    pub factor: usize,
    /// Dropout probability
    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,
    /// Time features encoding: timeF, fixed, learned
    #[arg(long, default_value = "timeF")]
    pub embed: String,
    /// Activation
    #[arg(long, default_value = "gelu")]
    pub activation: String,
    /// Whether to output attention in the encoder
    #[arg(long)]
    pub output_attention: bool,
    /// Patch length
    #[arg(long, default_value_t = 16)]
    pub patch_len: usize,
    #[arg(long, default_value_t = 0)]
    pub prompt_domain: i64,
    /// LLM backbone: LLAMA, GPT2, BERT
    #[arg(long, default_value = "LLAMA")]
    pub llm_model: String,
    /// LLM model dimension
    #[arg(long, default_value_t = 4096)]
    pub llm_dim: usize,
    #[arg(long, default_value_t = 6)]
    pub llm_layers: usize,
    #[arg(long, default_value_t = 8)]
    pub num_heads: usize,
    #[arg(long, default_value_t = 8)]
    pub num_experts: usize,
    #[arg(long, default_value_t = 0.1)]
    pub head_dropout: f64,
    /// Hidden layer dimensions of the projector
    #[arg(long, num_args = 1.., default_values_t = [128usize, 128])]
    pub p_hidden_dims: Vec<usize>,
    /// Number of hidden layers in the projector
    #[arg(long, default_value_t = 2)]
    pub p_hidden_layers: usize,
    /// Channel independence (1) or dependence (0)
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = boolish())]
    pub channel_independence: bool,
    /// Series decomposition: moving_avg or dft_decomp
    #[arg(long, default_value = "moving_avg")]
    pub decomp_method: String,
    /// Whether to normalize input windows
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = boolish())]
    pub use_norm: bool,
    #[arg(long, default_value_t = 2)]
    pub down_sampling_layers: usize,
    #[arg(long, default_value_t = 1)]
    pub down_sampling_window: usize,
    /// Down sampling method: avg, max, conv
    #[arg(long, default_value = "avg")]
    pub down_sampling_method: String,
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = boolish())]
    pub use_future_temporal_feature: bool,

    // --- optimization ---
    /// Data loader workers
    #[arg(long, default_value_t = 10)]
    pub num_workers: usize,
    /// Number of repeated runs
    #[arg(long, default_value_t = 1)]
    pub itr: usize,
    /// Training epochs
    #[arg(long, default_value_t = 10)]
    pub train_epochs: usize,
    /// Alignment epochs
    #[arg(long, default_value_t = 10)]
    pub align_epochs: usize,
    /// EMA decay; 1 disables the EMA callback
    #[arg(long, default_value_t = 0.995)]
    pub ema_decay: f64,
    /// Batch size of training input data
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    /// Batch size of model evaluation
    #[arg(long, default_value_t = 8)]
    pub eval_batch_size: usize,
    /// Early stopping patience
    #[arg(long, default_value_t = 10)]
    pub patience: usize,
    /// Optimizer learning rate
    #[arg(long, default_value_t = 0.0001)]
    pub learning_rate: f64,
    /// Experiment description
    #[arg(long, default_value = "test")]
    pub des: String,
    /// Loss function
    #[arg(long, default_value = "MSE")]
    pub loss: String,
    /// Learning-rate adjustment: COS, TST, constant
    #[arg(long, default_value = "COS")]
    pub lradj: String,
    #[arg(long, default_value_t = 0.2)]
    pub pct_start: f64,
    /// Use automatic mixed precision
    #[arg(long)]
    pub use_amp: bool,
    /// Percentage of the training split to use
    #[arg(long, default_value_t = 100)]
    pub percent: usize,
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub num_individuals: i64,
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = boolish())]
    pub enable_covariates: bool,
    #[arg(long, value_enum, default_value_t = CovariateType::Tensor)]
    pub cov_type: CovariateType,
    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,
    /// Memory-sharded strategy (1) or data-parallel (0)
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = boolish())]
    pub use_deep_speed: bool,
    /// Best checkpoints to retain; -1 keeps all
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub save_top_k: i64,
    /// Seed for every random stream of the run
    #[arg(long, default_value_t = 2021)]
    pub random_seed: u64,

    // --- diffusion ---
    /// KL weight
    #[arg(long, default_value_t = 1e-2)]
    pub k_z: f64,
    /// Condition weight
    #[arg(long, default_value_t = 1.0)]
    pub k_cond: f64,
    #[arg(long, default_value_t = 8)]
    pub d_z: usize,
    #[arg(long, default_value = "./configs/toy_8gauss.yml")]
    pub diffusion_config_dir: PathBuf,
    #[arg(long)]
    pub cond_pred_model_pertrain_dir: Option<PathBuf>,
    /// Feature dim for x in the diffusion model
    #[arg(long, default_value_t = 32)]
    pub cart_input_x_embed_dim: usize,
    #[arg(long, default_value_t = 0)]
    pub mse_timestep: usize,
    /// Use an MLP rather than a U-Net denoiser
    #[arg(long, default_value_t = false, action = ArgAction::Set, value_parser = boolish())]
    pub mlp_diffusion_net: bool,
    /// Diffusion steps
    #[arg(long, default_value_t = 1000)]
    pub timesteps: usize,

    // --- tracking ---
    /// Whether to open an experiment tracker session
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = boolish())]
    pub tracking: bool,
    #[arg(long, default_value = "Glucose Forecasting")]
    pub tracker_project: String,
    #[arg(long)]
    pub tracker_group: Option<String>,
    #[arg(long)]
    pub tracker_api_key: Option<String>,

    /// Values produced at runtime (e.g. by the dataset provider).
    #[arg(skip)]
    #[serde(skip)]
    pub runtime: RuntimeFields,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        #[derive(Parser)]
        struct Defaults {
            #[command(flatten)]
            config: ExperimentConfig,
        }
        Defaults::parse_from(["chronofit"]).config
    }
}

impl ExperimentConfig {
    /// Resolve the configuration from its layered sources and validate it.
    ///
    /// `parsed` is the record clap produced from `matches`; only the values the
    /// user typed take precedence over the file and the environment. Fails
    /// before any resource is acquired when a source is malformed.
    pub fn resolve(
        parsed: &Self,
        file: Option<&Path>,
        matches: &ArgMatches,
    ) -> Result<Self, MlError> {
        let explicit = explicit_cli_values(parsed, matches)?;

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            if !path.exists() {
                return Err(MlError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));
        figment = figment.merge(Serialized::defaults(explicit));

        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the semantic constraints that typed parsing cannot express.
    pub fn validate(&self) -> Result<(), MlError> {
        let positive = [
            ("seq_len", self.seq_len),
            ("pred_len", self.pred_len),
            ("stride", self.stride),
            ("batch_size", self.batch_size),
            ("eval_batch_size", self.eval_batch_size),
            ("train_epochs", self.train_epochs),
            ("itr", self.itr),
            ("num_nodes", self.num_nodes),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("percent", self.percent),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(MlError::config(format!("`{name}` must be positive")));
            }
        }
        if self.percent > 100 {
            return Err(MlError::config("`percent` must be at most 100"));
        }
        if !(self.ema_decay > 0.0 && self.ema_decay <= 1.0) {
            return Err(MlError::config(format!(
                "`ema_decay` must be in (0, 1], got {}",
                self.ema_decay
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MlError::config(format!(
                "`dropout` must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MlError::config("`learning_rate` must be positive"));
        }
        if !(0.0..=1.0).contains(&self.pct_start) {
            return Err(MlError::config("`pct_start` must be in [0, 1]"));
        }
        if self.save_top_k < -1 {
            return Err(MlError::config("`save_top_k` must be -1, 0 or positive"));
        }
        if self.model_family == ModelFamily::Diffusion && self.timesteps == 0 {
            return Err(MlError::config("`timesteps` must be positive"));
        }
        self.precision
            .parse::<crate::training::trainer::Precision>()
            .map_err(MlError::config)?;
        self.lradj
            .parse::<crate::model::optim::LrAdjust>()
            .map_err(MlError::config)?;
        Ok(())
    }

    /// The tracker-safe view of the configuration.
    ///
    /// Primitive fields round-trip unchanged, integer lists stay arrays, runtime
    /// values that are not scalars are stringified and the tracker API key is
    /// omitted. `self` is not modified.
    pub fn tracker_view(&self) -> Result<BTreeMap<String, Value>, MlError> {
        let mut view: BTreeMap<String, Value> = match serde_json::to_value(self)? {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(MlError::config(format!(
                    "configuration serialized to a non-object: {other}"
                )));
            }
        };
        view.remove("tracker_api_key");
        for (key, value) in self.runtime.iter() {
            view.insert(key.clone(), value.loggable());
        }
        Ok(view)
    }

    /// Override exactly the named fields, type-checked through serde.
    ///
    /// Unknown field names are configuration errors. Runtime values survive.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Result<(), MlError> {
        let Value::Object(mut map) = serde_json::to_value(&*self)? else {
            return Err(MlError::config("configuration serialized to a non-object"));
        };
        for (key, value) in overrides {
            if !map.contains_key(key) {
                return Err(MlError::config(format!("unknown configuration field `{key}`")));
            }
            map.insert(key.clone(), value.clone());
        }
        let mut updated: Self = serde_json::from_value(Value::Object(map))
            .map_err(|e| MlError::config(format!("invalid override: {e}")))?;
        updated.validate()?;
        updated.runtime = std::mem::take(&mut self.runtime);
        *self = updated;
        Ok(())
    }

    /// Directory holding both checkpoint policies' snapshots for a run.
    pub fn checkpoint_dir(&self, run_name: &str) -> PathBuf {
        self.log_dir
            .join(&self.model)
            .join(run_name)
            .join("checkpoints")
    }
}

/// Values that were given explicitly on the command line, keyed by field name.
fn explicit_cli_values(
    parsed: &ExperimentConfig,
    matches: &ArgMatches,
) -> Result<serde_json::Map<String, Value>, MlError> {
    let Value::Object(all) = serde_json::to_value(parsed)? else {
        return Err(MlError::config("configuration serialized to a non-object"));
    };
    Ok(all
        .into_iter()
        .filter(|(key, _)| matches.value_source(key) == Some(ValueSource::CommandLine))
        .collect())
}

/// A value attached to the configuration at runtime.
#[derive(Clone)]
pub enum RuntimeValue {
    Json(Value),
    /// A handle only meaningful inside the process (scalers, tokenizers).
    Opaque {
        type_name: &'static str,
        value: Arc<dyn Any + Send + Sync>,
    },
}

impl RuntimeValue {
    /// Scalars as-is, everything else as text.
    fn loggable(&self) -> Value {
        match self {
            Self::Json(v @ (Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))) => {
                v.clone()
            }
            Self::Json(other) => Value::String(other.to_string()),
            Self::Opaque { type_name, .. } => Value::String(format!("<opaque {type_name}>")),
        }
    }
}

impl fmt::Debug for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(v) => write!(f, "Json({v})"),
            Self::Opaque { type_name, .. } => write!(f, "Opaque({type_name})"),
        }
    }
}

/// Side table of runtime values, excluded from serialization.
#[derive(Debug, Clone, Default)]
pub struct RuntimeFields(BTreeMap<String, RuntimeValue>);

impl RuntimeFields {
    pub fn insert_json(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), RuntimeValue::Json(value));
    }

    pub fn insert_opaque<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.0.insert(
            key.into(),
            RuntimeValue::Opaque {
                type_name: std::any::type_name::<T>(),
                value: Arc::new(value),
            },
        );
    }

    pub fn get_json(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            Some(RuntimeValue::Json(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_opaque<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        match self.0.get(key) {
            Some(RuntimeValue::Opaque { value, .. }) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RuntimeValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
