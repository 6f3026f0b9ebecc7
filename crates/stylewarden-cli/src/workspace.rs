//! State directory layout and loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use url::Url;

use stylewarden::config::{resolve_sites_path, resolve_state_dir};
use stylewarden::{EngineConfig, FileStore, KeyValueStore, ResourceDescriptor, SiteRegistry};

/// Resolved locations for one invocation.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub state_dir: PathBuf,
    pub sites_path: PathBuf,
}

impl Workspace {
    /// Resolve from CLI flags, falling back to environment and home directory.
    pub fn resolve(home: Option<&Path>, sites: Option<&Path>) -> Self {
        let state_dir = resolve_state_dir(home);
        let sites_path = resolve_sites_path(sites, &state_dir);
        Self {
            state_dir,
            sites_path,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("store.json")
    }

    pub fn config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig::load(&self.config_path())?)
    }

    pub fn registry(&self) -> Result<SiteRegistry> {
        SiteRegistry::load(&self.sites_path)
            .with_context(|| format!("failed to load sites from {}", self.sites_path.display()))
    }

    pub fn store(&self) -> Result<Arc<dyn KeyValueStore>> {
        let path = self.store_path();
        let store = FileStore::open(&path)
            .with_context(|| format!("failed to open store {}", path.display()))?;
        Ok(Arc::new(store))
    }
}

/// Look up a site by id.
pub fn site<'a>(registry: &'a SiteRegistry, id: &str) -> Result<&'a ResourceDescriptor> {
    registry
        .get(id)
        .ok_or_else(|| anyhow!("unknown site `{id}`"))
}

/// Pick the site for a page: explicit id wins, otherwise match on host.
pub fn site_for_page<'a>(
    registry: &'a SiteRegistry,
    page: &Url,
    explicit: Option<&str>,
) -> Result<&'a ResourceDescriptor> {
    if let Some(id) = explicit {
        return site(registry, id);
    }
    let host = page
        .host_str()
        .ok_or_else(|| anyhow!("{page} has no host"))?;
    registry
        .find_for_host(host)
        .ok_or_else(|| anyhow!("no site is configured for host `{host}` (use --site)"))
}
