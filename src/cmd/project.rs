//! Project initialization: `foundry init`.

use anyhow::{Context, Result};

use foundry::config::{FoundryConfig, FoundryToml};
use foundry::factory::worktree::WorktreeManager;
use foundry::factory::{ensure_project, open_db};

pub async fn cmd_init(project_dir: &std::path::Path, force: bool) -> Result<()> {
    let foundry_dir = project_dir.join(".foundry");
    std::fs::create_dir_all(foundry_dir.join("logs"))
        .with_context(|| format!("Failed to create {}", foundry_dir.display()))?;

    let config_path = foundry_dir.join("foundry.toml");
    let wrote_config = force || !config_path.exists();
    if wrote_config {
        FoundryToml::default().save(&config_path)?;
    }

    let config = FoundryConfig::new(project_dir.to_path_buf())?;
    let db = open_db(&config)?;
    let project = ensure_project(&db, &config.project_dir).await?;

    if config.project_dir.join(".git").exists() {
        let toml = &config.toml;
        let manager = WorktreeManager::new(
            &config.project_dir,
            toml.worktree_root(&config.project_dir),
            toml.git.remote.clone(),
            toml.git_timeout(),
        );
        if let Err(e) = manager.ensure_excludes().await {
            tracing::warn!(error = %e, "could not update .git/info/exclude");
        }
    }

    println!("Initialized foundry project '{}' at {}", project.name, foundry_dir.display());
    println!();
    println!("  .foundry/");
    if wrote_config {
        println!("  ├── foundry.toml  # Configuration (defaults written)");
    } else {
        println!("  ├── foundry.toml  # Configuration (kept existing file)");
    }
    println!("  ├── foundry.db    # Cards, jobs, slots, worktrees");
    println!("  └── logs/         # Daily log files");
    println!();
    println!("Next steps:");
    println!("  1. Set [checks] and [tracker] in .foundry/foundry.toml");
    println!("  2. Add work with `foundry add \"<title>\" --ready`");
    println!("  3. Run `foundry run` to start the worker pool");

    Ok(())
}
