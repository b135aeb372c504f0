//! Rainfall prediction service
//! - Model artifact loaded once at startup (raw estimator or bundle with schema)
//! - Demo heuristic when no model is available
//! - JSON API and form endpoint via warp

use anyhow::{anyhow, Result};
use rainfall::artifact;
use rainfall::config::AppConfig;
use rainfall::features::FeatureValues;
use rainfall::http;
use rainfall::service::PredictionService;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::signal;

#[derive(StructOpt, Debug)]
#[structopt(name = "rainfall")]
struct Cli {
    /// Path to config file
    #[structopt(short, long, default_value = "rainfall.toml")]
    config: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Model artifact, overrides `model_path`
        #[structopt(long)]
        model: Option<String>,
        /// Bind address, overrides `bind`
        #[structopt(long)]
        bind: Option<String>,
    },
    /// Predict once from a JSON file of feature values
    Predict {
        #[structopt(short, long, parse(from_os_str))]
        input: PathBuf,
        #[structopt(long)]
        model: Option<String>,
    },
    /// Describe a model artifact without serving it
    Inspect {
        #[structopt(parse(from_os_str))]
        path: PathBuf,
    },
    /// Re-encode an artifact; the encoding follows each file's extension
    Convert {
        #[structopt(parse(from_os_str))]
        input: PathBuf,
        #[structopt(parse(from_os_str))]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::from_args();
    let mut cfg = AppConfig::load_or_default(&args.config)?;

    match args.cmd {
        Command::Serve { model, bind } => {
            if let Some(model) = model {
                cfg.model_path = model;
            }
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            let service = Arc::new(PredictionService::from_config(&cfg));
            tokio::select! {
                res = http::serve(&cfg, service) => res?,
                _ = signal::ctrl_c() => {
                    log::info!("Shutdown signal received");
                }
            }
        }
        Command::Predict { input, model } => {
            if let Some(model) = model {
                cfg.model_path = model;
            }
            let service = PredictionService::from_config(&cfg);
            let content = fs::read_to_string(&input)?;
            let doc: serde_json::Value = serde_json::from_str(&content)?;
            let object = doc
                .as_object()
                .ok_or_else(|| anyhow!("'{}' must contain a JSON object", input.display()))?;
            let result = service.predict_and_log(&FeatureValues::from_json(object))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Inspect { path } => {
            let report = artifact::inspect(&path, &cfg.default_feature_schema());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Convert { input, output } => {
            let persisted = artifact::read_artifact(&input)?;
            artifact::resolve(persisted.clone(), &cfg.default_feature_schema())?;
            artifact::save(&output, &persisted)?;
            log::info!("Wrote {} from {}", output.display(), input.display());
        }
    }
    Ok(())
}
