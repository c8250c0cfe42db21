use anyhow::{bail, Result};
use std::path::PathBuf;

use replacekit::ReplaceConfig;

pub fn run(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from("replacekit.toml"));

    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    ReplaceConfig::create_default_config(&path)?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_refuses_to_overwrite_without_force() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replacekit.toml");

        run(Some(path.clone()), false).unwrap();
        assert!(ReplaceConfig::load_from_file(&path).is_ok());
        assert!(run(Some(path.clone()), false).is_err());
        assert!(run(Some(path), true).is_ok());
    }
}
