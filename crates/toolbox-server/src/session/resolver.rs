//! Resolves session targets to real backends.
//!
//! `local` spawns a shell in a PTY. `ssh` and `sftp` look the host up in the
//! configured host list and open a channel on the cached SSH connection for
//! that host's address and credentials.

use super::backend::{BackendResolver, FileChannel, Place, SessionTarget, TerminalBackend};
use super::pty::LocalShell;
use crate::adapters::ssh::{SshService, SshTarget};
use crate::config::HostEntry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use toolbox_core::{ResourceCache, ToolboxError, ToolboxResult, WindowSize};

pub struct DefaultResolver {
    cache: Arc<ResourceCache>,
    hosts: Vec<HostEntry>,
    shell: Option<String>,
    ssh_idle_timeout: Duration,
}

impl DefaultResolver {
    pub fn new(
        cache: Arc<ResourceCache>,
        hosts: Vec<HostEntry>,
        shell: Option<String>,
        ssh_idle_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            hosts,
            shell,
            ssh_idle_timeout,
        }
    }

    fn ssh_target(&self, target: &SessionTarget) -> ToolboxResult<SshTarget> {
        let id = target.require_place_id()?;
        let host = self
            .hosts
            .iter()
            .find(|h| h.id == id)
            .ok_or_else(|| ToolboxError::NotFound(format!("host {id}")))?;
        SshTarget::from_host(host)
    }

    async fn ssh_service(&self, target: &SessionTarget) -> ToolboxResult<Arc<SshService>> {
        let ssh = self.ssh_target(target)?;
        SshService::cached(&self.cache, ssh, self.ssh_idle_timeout).await
    }
}

#[async_trait]
impl BackendResolver for DefaultResolver {
    async fn open_shell(
        &self,
        target: &SessionTarget,
        size: WindowSize,
    ) -> ToolboxResult<Arc<dyn TerminalBackend>> {
        match target.place {
            Place::Local => {
                let shell = self.shell.clone();
                let local =
                    tokio::task::spawn_blocking(move || LocalShell::spawn(shell.as_deref(), size)).await??;
                Ok(Arc::new(local))
            }
            Place::Ssh => {
                let service = self.ssh_service(target).await?;
                Ok(Arc::new(service.open_shell(size).await?))
            }
            Place::Sftp => Err(ToolboxError::InvalidMessage(
                "sftp sessions have no shell; open a file session instead".into(),
            )),
        }
    }

    async fn open_files(&self, target: &SessionTarget) -> ToolboxResult<Arc<dyn FileChannel>> {
        match target.place {
            Place::Ssh | Place::Sftp => {
                let service = self.ssh_service(target).await?;
                Ok(Arc::new(service.open_sftp().await?))
            }
            Place::Local => Err(ToolboxError::InvalidMessage(
                "file sessions need a remote host".into(),
            )),
        }
    }

    async fn check(&self, target: &SessionTarget) -> ToolboxResult<()> {
        match target.place {
            Place::Local => Ok(()),
            Place::Ssh | Place::Sftp => {
                let ssh = self.ssh_target(target)?;
                tokio::task::spawn_blocking(move || SshService::verify(&ssh)).await?
            }
        }
    }
}
