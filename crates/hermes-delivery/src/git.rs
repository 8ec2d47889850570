//! SSH git transport.
//!
//! Delivering an event to an `ssh_git` destination synchronises a local bare
//! mirror of the remote repository: the first delivery clones it, later
//! deliveries fetch and prune. libgit2 does the protocol work on a blocking
//! worker thread; credentials come from the configured key pair or the ssh
//! agent and are offered once, so a rejected key fails fast.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use git2::{
    build::RepoBuilder, AutotagOption, CertificateCheckStatus, Cred, CredentialType, ErrorClass,
    ErrorCode, FetchOptions, FetchPrune, RemoteCallbacks, Repository,
};
use hermes_core::Destination;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    client::{DeliveryReceipt, DeliveryRequest, Transport},
    error::{DeliveryError, Result},
};

const REMOTE: &str = "origin";
const MIRROR_REFSPEC: &str = "+refs/*:refs/*";

/// SSH git transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory holding one mirror per destination key.
    pub mirror_root: PathBuf,
    /// Private key offered to the remote. The public half is read from the
    /// sibling `.pub` file when present. The ssh agent is used when unset.
    pub identity_file: Option<PathBuf>,
    /// Trust any host key instead of checking `known_hosts`.
    pub skip_host_key_check: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            mirror_root: PathBuf::from("mirrors"),
            identity_file: None,
            skip_host_key_check: false,
        }
    }
}

/// Mirror-sync transport for `ssh_git` destinations.
#[derive(Debug, Clone)]
pub struct GitSshTransport {
    config: Arc<GitConfig>,
}

impl GitSshTransport {
    /// Creates the transport.
    pub fn new(config: GitConfig) -> Self {
        Self { config: Arc::new(config) }
    }

    /// Local mirror directory for a destination key.
    pub fn mirror_path(&self, key: &str) -> PathBuf {
        self.config.mirror_root.join(sanitize_key(key))
    }
}

/// Sets the shared flag when dropped, which makes the blocking sync abort
/// at its next progress callback.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for GitSshTransport {
    async fn send(
        &self,
        _request: &DeliveryRequest,
        destination: &Destination,
    ) -> Result<DeliveryReceipt> {
        validate_remote(&destination.address)?;

        let started = Instant::now();
        let mirror = self.mirror_path(destination.key.as_str());
        tokio::fs::create_dir_all(&self.config.mirror_root).await.map_err(|e| {
            DeliveryError::configuration(format!(
                "cannot create mirror root {}: {e}",
                self.config.mirror_root.display()
            ))
        })?;

        let aborted = Arc::new(AtomicBool::new(false));
        let _guard = AbortOnDrop(aborted.clone());
        let config = self.config.clone();
        let address = destination.address.clone();

        tokio::task::spawn_blocking(move || sync_mirror(&config, &address, &mirror, &aborted))
            .await
            .map_err(|e| DeliveryError::git_transport(format!("git worker failed: {e}")))??;

        Ok(DeliveryReceipt { status_code: None, duration: started.elapsed() })
    }
}

/// Clones `url` into a bare mirror at `mirror`, or fetches and prunes when
/// the mirror already exists. Blocks the calling thread.
fn sync_mirror(config: &GitConfig, url: &str, mirror: &Path, aborted: &AtomicBool) -> Result<()> {
    if mirror.is_dir() {
        let repo = Repository::open_bare(mirror).map_err(|e| {
            DeliveryError::configuration(format!(
                "mirror {} is not a git repository: {}",
                mirror.display(),
                e.message()
            ))
        })?;

        if repo.find_remote(REMOTE).ok().and_then(|r| r.url().map(str::to_owned)).as_deref()
            != Some(url)
        {
            debug!(mirror = %mirror.display(), url, "repointing mirror remote");
            repo.remote_delete(REMOTE).ok();
            repo.remote_with_fetch(REMOTE, url, MIRROR_REFSPEC).map_err(|e| classify_git_error(&e))?;
        }

        let mut remote = repo.find_remote(REMOTE).map_err(|e| classify_git_error(&e))?;
        let no_refspecs: [&str; 0] = [];
        debug!(mirror = %mirror.display(), url, "fetching mirror");
        remote
            .fetch(&no_refspecs, Some(&mut fetch_options(config, aborted)), None)
            .map_err(|e| classify_git_error(&e))?;
    } else {
        debug!(mirror = %mirror.display(), url, "cloning mirror");
        let repo = RepoBuilder::new()
            .bare(true)
            .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC))
            .fetch_options(fetch_options(config, aborted))
            .clone(url, mirror)
            .map_err(|e| classify_git_error(&e))?;

        repo.config()
            .and_then(|mut c| c.set_bool("remote.origin.mirror", true))
            .map_err(|e| classify_git_error(&e))?;
    }

    Ok(())
}

fn fetch_options<'a>(config: &'a GitConfig, aborted: &'a AtomicBool) -> FetchOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut offered = false;

    callbacks.credentials(move |_url, username_from_url, allowed| {
        let username = username_from_url.unwrap_or("git");
        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username);
        }
        // libgit2 keeps asking after a rejection.
        if offered {
            return Err(git2::Error::new(ErrorCode::Auth, ErrorClass::Ssh, "ssh key rejected"));
        }
        offered = true;

        match &config.identity_file {
            Some(private) => {
                let public = private.with_extension("pub");
                Cred::ssh_key(username, public.is_file().then_some(public.as_path()), private, None)
            },
            None => Cred::ssh_key_from_agent(username),
        }
    });

    callbacks.certificate_check(move |_cert, _host| {
        Ok(if config.skip_host_key_check {
            CertificateCheckStatus::CertificateOk
        } else {
            CertificateCheckStatus::CertificatePassthrough
        })
    });

    callbacks.transfer_progress(move |_| !aborted.load(Ordering::Relaxed));
    callbacks.sideband_progress(move |_| !aborted.load(Ordering::Relaxed));

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options.prune(FetchPrune::On);
    options.download_tags(AutotagOption::All);
    options
}

/// Checks that an address is an SSH remote: `ssh://…` or scp-style
/// `user@host:path`.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidDestination` for anything else.
pub fn validate_remote(address: &str) -> Result<()> {
    if let Some(rest) = address.strip_prefix("ssh://") {
        if rest.split('/').next().is_some_and(|host| !host.is_empty()) && rest.contains('/') {
            return Ok(());
        }
        return Err(DeliveryError::invalid_destination(format!("malformed ssh URL: {address}")));
    }

    if address.contains("://") || address.starts_with('-') {
        return Err(DeliveryError::invalid_destination(format!(
            "unsupported git remote {address}, expected ssh://host/path or user@host:path"
        )));
    }

    let valid_scp = address.split_once(':').is_some_and(|(authority, path)| {
        let host = authority.rsplit('@').next().unwrap_or_default();
        authority.contains('@') && !host.is_empty() && !authority.contains('/') && !path.is_empty()
    });

    if valid_scp {
        Ok(())
    } else {
        Err(DeliveryError::invalid_destination(format!(
            "unsupported git remote {address}, expected ssh://host/path or user@host:path"
        )))
    }
}

/// Maps a libgit2 error to the delivery error taxonomy.
pub fn classify_git_error(error: &git2::Error) -> DeliveryError {
    let message = error.message().trim();
    let summary = if message.is_empty() { "git operation failed" } else { message };

    match (error.code(), error.class()) {
        (ErrorCode::Auth | ErrorCode::Certificate, _) => DeliveryError::authentication(summary),
        (ErrorCode::User, _) => DeliveryError::git_transport(format!("transfer aborted: {summary}")),
        (ErrorCode::NotFound, ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Repository) => {
            DeliveryError::invalid_destination(summary)
        },
        (_, ErrorClass::Filesystem) => DeliveryError::configuration(summary),
        _ => classify_git_message(summary),
    }
}

/// Classifies remote and ssh error text that libgit2 reports without a
/// specific code.
fn classify_git_message(message: &str) -> DeliveryError {
    let lowered = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

    if has(&[
        "permission denied",
        "failed to authenticate",
        "authentication failed",
        "hostkey",
        "host key",
        "no more authentication methods",
    ]) {
        DeliveryError::authentication(message)
    } else if has(&[
        "repository not found",
        "does not appear to be a git repository",
        "project not found",
    ]) {
        DeliveryError::invalid_destination(message)
    } else if has(&["connection reset", "broken pipe"]) {
        DeliveryError::connection_reset(message)
    } else if has(&[
        "failed to connect",
        "connection refused",
        "failed to resolve address",
        "timed out",
        "network is unreachable",
    ]) {
        DeliveryError::network(message)
    } else {
        DeliveryError::git_transport(message)
    }
}

fn sanitize_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    format!("{sanitized}.git")
}
