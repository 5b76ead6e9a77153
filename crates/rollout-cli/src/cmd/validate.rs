use crate::output::print_json;
use anyhow::Context;
use rollout_core::config::{Config, WarnLevel};
use rollout_core::store::DefinitionCatalog;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let catalog = DefinitionCatalog::load(root).context("failed to load definitions")?;

    let mut warnings = config.validate();
    warnings.extend(catalog.validate());

    if json {
        let value = serde_json::json!({
            "environments": catalog.environments.len(),
            "releases": catalog.releases.len(),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!(
            "Valid: {} environment(s), {} release(s). No warnings.",
            catalog.environments.len(),
            catalog.releases.len()
        );
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("validation found errors");
    }
    Ok(())
}
