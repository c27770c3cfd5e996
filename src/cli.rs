use crate::config::EngineConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "oibus-engine",
    version,
    about = "Data acquisition engine: scheduled South reads, durable cache, North delivery"
)]
pub struct Args {
    /// Connector topology document; defaults to `<data-dir>/engine.json`.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Root for the checkpoint database and North caches.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl Args {
    /// Overlays command-line paths on the environment configuration.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(data_dir) = &self.data_dir {
            if config.config_file == config.data_dir.join("engine.json") {
                config.config_file = data_dir.join("engine.json");
            }
            config.data_dir = data_dir.clone();
        }
        if let Some(path) = &self.config {
            config.config_file = path.clone();
        }
    }
}
