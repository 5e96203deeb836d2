//! Layered configuration: built-in defaults, then the TOML file, then
//! `RESYNC_POOL_*` environment variables (`__` separates nested keys, e.g.
//! `RESYNC_POOL_AUTOSCALE__ENABLED=false`).

use std::path::Path;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use resync_pool::ManagerConfig;

pub const ENV_PREFIX: &str = "RESYNC_POOL_";

pub fn load(path: &Path) -> Result<ManagerConfig> {
    if !path.is_file() {
        bail!("configuration file {} not found", path.display());
    }
    let config: ManagerConfig = figment(path)
        .extract()
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(ManagerConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
}
