use anyhow::Context;
use rollout_core::{config::Config, io, paths};
use std::path::Path;

const DEFINITIONS_TEMPLATE: &str = "\
# Release definitions. Example:
#
# environments:
#   - { id: 1, name: dev, customer_id: 1 }
#   - { id: 2, name: prod, customer_id: 1, requires_approval: true }
# releases:
#   - id: 1
#     name: web
#     version: \"1.0\"
#     customer_id: 1
#     targets:
#       stages:
#         - { id: 1, environment_id: 1, order_index: 0 }
#         - { id: 2, environment_id: 2, order_index: 1 }
environments: []
releases: []
";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing rollout in: {}", root.display());

    let dir = paths::rollout_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    if !paths::config_path(root).exists() {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let definitions = paths::definitions_path(root);
    if io::write_if_missing(&definitions, DEFINITIONS_TEMPLATE.as_bytes())
        .context("failed to write definitions.yaml")?
    {
        println!("  created: {}", paths::DEFINITIONS_FILE);
    } else {
        println!("  exists:  {}", paths::DEFINITIONS_FILE);
    }

    println!("\nNext: set dispatch commands in {} and run 'rollout validate'.", paths::CONFIG_FILE);
    Ok(())
}
