use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ROLLOUT_DIR: &str = ".rollout";

pub const CONFIG_FILE: &str = ".rollout/config.yaml";
pub const DEFINITIONS_FILE: &str = ".rollout/definitions.yaml";
pub const EXECUTIONS_DB: &str = ".rollout/executions.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn rollout_dir(root: &Path) -> PathBuf {
    root.join(ROLLOUT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn definitions_path(root: &Path) -> PathBuf {
    root.join(DEFINITIONS_FILE)
}

pub fn executions_db_path(root: &Path) -> PathBuf {
    root.join(EXECUTIONS_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_rollout_dir() {
        let root = Path::new("/srv/app");
        assert_eq!(rollout_dir(root), PathBuf::from("/srv/app/.rollout"));
        assert!(config_path(root).starts_with(rollout_dir(root)));
        assert!(definitions_path(root).starts_with(rollout_dir(root)));
        assert_eq!(
            executions_db_path(root),
            PathBuf::from("/srv/app/.rollout/executions.db")
        );
    }
}
