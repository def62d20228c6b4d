//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `project` | `Init`                           |
//! | `cards`   | `Add`, `Ready`                   |
//! | `run`     | `Run`                            |
//! | `factory` | `Status`, `Cancel`, `Cleanup`    |
//! | `config`  | `Config`                         |

pub mod cards;
pub mod config;
pub mod factory;
pub mod project;
pub mod run;

pub use cards::{cmd_add, cmd_ready};
pub use config::cmd_config;
pub use factory::{cmd_cancel, cmd_cleanup, cmd_status};
pub use project::cmd_init;
pub use run::cmd_run;

use anyhow::{Result, bail};
use std::path::Path;

use foundry::config::FoundryConfig;
use foundry::factory::db::DbHandle;
use foundry::factory::models::Project;
use foundry::factory::{ensure_project, open_db};

/// Load config and open the database of an initialized project.
pub(crate) async fn open_project(project_dir: &Path) -> Result<(FoundryConfig, DbHandle, Project)> {
    if !project_dir.join(".foundry").is_dir() {
        bail!(
            "No .foundry directory in {}. Run `foundry init` first.",
            project_dir.display()
        );
    }
    let config = FoundryConfig::new(project_dir.to_path_buf())?;
    let db = open_db(&config)?;
    let project = ensure_project(&db, &config.project_dir).await?;
    Ok((config, db, project))
}
