use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cookgate_pkg::{
    BookshelfCredentials, BookshelfStorage, ChefServer, FileStoreStorage, HttpChefServer,
    Registry, Storage, SupermarketClient, TransportOptions,
};
use cookgate_vcs::VcsHost;
use url::Url;

use crate::config::Config;

/// The collaborators the gate talks to. Built once from a configuration; tests assemble one
/// from fakes.
#[derive(Clone)]
pub struct Backends {
    pub chef: Arc<dyn ChefServer>,
    pub storage: Arc<dyn Storage>,
    pub community: Option<Arc<dyn Registry>>,
    pub private_registry: Option<Arc<dyn Registry>>,
    /// Hosting backend per organization/group name.
    pub vcs: BTreeMap<String, Arc<dyn VcsHost>>,
}

impl Backends {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let chef_opts = TransportOptions::insecure(cfg.chef.ssl_no_verify);
        let chef = HttpChefServer::new(&cfg.chef.server_url, &cfg.chef.user, &chef_opts)?;

        let storage_url = cfg
            .chef
            .storage
            .url
            .as_deref()
            .unwrap_or(&cfg.chef.server_url);
        let storage_url = Url::parse(storage_url)
            .with_context(|| format!("parse storage url {storage_url:?}"))?;
        let storage: Arc<dyn Storage> = if cfg.chef.kind.uses_bookshelf() {
            let creds = BookshelfCredentials {
                access_key: cfg.chef.storage.access_key.clone(),
                secret_key: cfg.chef.storage.secret_key.clone(),
                region: cfg.chef.storage.region.clone(),
            };
            Arc::new(BookshelfStorage::new(storage_url, creds, &chef_opts))
        } else {
            Arc::new(FileStoreStorage::new(
                storage_url,
                cfg.chef.storage.token.clone(),
                &chef_opts,
            ))
        };

        let community: Option<Arc<dyn Registry>> = if cfg.community.url.trim().is_empty() {
            None
        } else {
            let client =
                SupermarketClient::new(&cfg.community.url, None, &TransportOptions::default())
                    .context("configure community registry")?;
            Some(Arc::new(client))
        };

        let private_registry: Option<Arc<dyn Registry>> = match cfg.supermarket.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let client = SupermarketClient::new(
                    url,
                    cfg.supermarket.token.clone(),
                    &TransportOptions::insecure(cfg.supermarket.ssl_no_verify),
                )
                .context("configure private registry")?;
                Some(Arc::new(client))
            }
            _ => None,
        };

        let mut vcs = BTreeMap::new();
        for (org, host) in &cfg.git {
            let host = cookgate_vcs::from_config(org, host)
                .with_context(|| format!("configure {} host for {org}", host.kind))?;
            vcs.insert(org.clone(), Arc::from(host));
        }

        Ok(Self {
            chef: Arc::new(chef),
            storage,
            community,
            private_registry,
            vcs,
        })
    }

    pub fn vcs_host(&self, org: &str) -> Option<&Arc<dyn VcsHost>> {
        self.vcs.get(org)
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("community", &self.community.as_ref().map(|r| r.base_url().as_str()))
            .field(
                "private_registry",
                &self.private_registry.as_ref().map(|r| r.base_url().as_str()),
            )
            .field("vcs", &self.vcs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
