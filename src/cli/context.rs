use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::config::{AppConfig, DataLayout};
use crate::core::isolation::{Isolator, detect_repository};
use crate::core::patch::{Applier, FilePatchStore, PatchController};
use crate::core::sandbox::SandboxRunner;

/// Data layout plus loaded configuration, shared by every subcommand.
pub(crate) struct AppContext {
    pub layout: DataLayout,
    pub config: AppConfig,
}

impl AppContext {
    pub async fn load() -> Result<Self> {
        let layout = DataLayout::native();
        layout.ensure()?;
        let config = AppConfig::load(&layout.root).await?;
        Ok(Self { layout, config })
    }

    /// `[apply] project_root`, else the current directory.
    pub fn project_root(&self) -> Result<PathBuf> {
        match &self.config.apply.project_root {
            Some(root) => Ok(root.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub async fn controller(&self) -> Result<Arc<PatchController>> {
        let store = FilePatchStore::new(self.layout.patches_dir())?;
        let validator = SandboxRunner::new(self.layout.sandbox_dir(), self.config.sandbox.clone());
        let repo = detect_repository(&self.project_root()?).await;
        let isolator = Isolator::new(repo, self.layout.auto_edits_dir(), &self.config.governance);
        Ok(Arc::new(PatchController::new(
            Arc::new(store),
            Arc::new(validator),
            Arc::new(isolator),
            self.config.governance.clone(),
        )))
    }

    pub fn applier(&self) -> Result<Applier> {
        Ok(Applier::new(
            self.project_root()?,
            self.layout.backups_dir().join("apply"),
            self.layout.apply_history_file(),
            self.config.apply.clone(),
        ))
    }
}
