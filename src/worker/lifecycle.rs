//! Install and activate: precache population, stale cache eviction and
//! taking control of clients.

use futures::future::join_all;
use std::sync::MutexGuard;
use tracing::{debug, error, info, warn};

use super::ServiceWorker;
use crate::cache::CacheStorage;
use crate::error::WorkerError;
use crate::http::{Request, RequestKey, Response};
use crate::network::Fetcher;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
  #[default]
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Failed to install or activate
  Redundant,
}

#[derive(Debug, Default)]
pub(super) struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
  controlling: bool,
}

impl Lifecycle {
  fn transition(&mut self, to: WorkerState) -> Result<(), WorkerError> {
    let from = self.state;
    if !is_valid_transition(from, to) {
      return Err(WorkerError::InvalidTransition { from, to });
    }
    debug!(?from, ?to, "Worker state change");
    self.state = to;
    Ok(())
  }
}

/// Check if a state transition is valid
fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;

  matches!(
    (from, to),
    (Parsed, Installing)
      | (Installing, Installed)
      | (Installing, Redundant)
      | (Installed, Activating)
      | (Activating, Activated)
      | (Activating, Redundant)
      | (Activated, Redundant)
  )
}

/// What activation cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Stale caches deleted
  pub purged: Vec<String>,
  /// Stale caches whose deletion failed
  pub failed: Vec<String>,
}

/// How `register` brought the worker up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
  /// Fresh install; `precached` manifest entries were stored
  Installed {
    precached: usize,
    activation: ActivationReport,
  },
  /// The current shell cache already existed
  Resumed { activation: ActivationReport },
}

impl<S, F> ServiceWorker<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn transition(&self, to: WorkerState) -> Result<(), WorkerError> {
    self.lifecycle().transition(to)
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle().state
  }

  /// Whether fetches from open pages are intercepted.
  pub fn is_controlling(&self) -> bool {
    let lifecycle = self.lifecycle();
    lifecycle.controlling && lifecycle.state == WorkerState::Activated
  }

  /// Populate the shell cache from the manifest.
  ///
  /// Returns how many entries were stored. A population failure is logged
  /// and the install still completes with nothing stored, unless
  /// `strict_install` is set, in which case the worker becomes redundant.
  pub async fn install(&self) -> Result<usize, WorkerError> {
    self.transition(WorkerState::Installing)?;
    info!(cache = %self.config.shell_cache_name, "Installing worker");

    let stored = match self.precache().await {
      Ok(count) => {
        info!(count, "Precaching completed successfully");
        count
      }
      Err(e) if self.config.strict_install => {
        error!(error = %e, "Precaching failed");
        self.transition(WorkerState::Redundant)?;
        return Err(e);
      }
      Err(e) => {
        // complete with an empty shell; the next register retries
        error!(error = %e, "Precaching failed");
        0
      }
    };

    self.transition(WorkerState::Installed)?;
    self.skip_waiting();
    Ok(stored)
  }

  /// Fetch every manifest entry, then store all of them or none.
  ///
  /// The shell cache is only created once every fetch has succeeded, so a
  /// failed population never looks like a finished install.
  async fn precache(&self) -> Result<usize, WorkerError> {
    let cache = &self.config.shell_cache_name;
    info!(count = self.config.manifest.len(), "Precaching assets");

    let fetches = self.config.manifest.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let result = self.fetcher.fetch(&request).await;
        (request, result)
      }
    });

    let mut ready: Vec<(RequestKey, Response)> = Vec::new();
    let mut failed = Vec::new();
    for (request, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_ok() => ready.push((request.key(), response)),
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "Precache entry returned an error status");
          failed.push(request.url.to_string());
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "Precache entry could not be fetched");
          failed.push(request.url.to_string());
        }
      }
    }

    if !failed.is_empty() {
      return Err(WorkerError::Precache { failed });
    }

    let created = !self.storage.has(cache).await?;
    let mut written: Vec<&RequestKey> = Vec::with_capacity(ready.len());
    for (key, response) in &ready {
      if let Err(e) = self.storage.put(cache, key, response).await {
        self.discard_partial(cache, created, &written).await;
        return Err(e.into());
      }
      written.push(key);
    }
    if ready.is_empty() {
      self.storage.open(cache).await?;
    }
    Ok(ready.len())
  }

  /// Undo a precache whose storage failed part way through.
  async fn discard_partial(&self, cache: &str, created: bool, written: &[&RequestKey]) {
    warn!(cache, count = written.len(), "Discarding partially precached entries");
    if created {
      if let Err(e) = self.storage.delete_cache(cache).await {
        warn!(cache, error = %e, "Failed to delete partial shell cache");
      }
      return;
    }
    for key in written {
      if let Err(e) = self.storage.delete(cache, key).await {
        warn!(cache, url = %key.url, error = %e, "Failed to remove precached entry");
      }
    }
  }

  /// Activate as soon as installation finishes instead of waiting for old
  /// clients to close.
  pub fn skip_waiting(&self) {
    self.lifecycle().skip_waiting = true;
  }

  /// Whether the installed worker asked to bypass the waiting phase.
  pub fn skips_waiting(&self) -> bool {
    self.lifecycle().skip_waiting
  }

  /// Delete every cache the current generation does not own, then claim
  /// clients.
  ///
  /// Deletions run in parallel and are best-effort: a failed deletion is
  /// reported but does not fail activation.
  pub async fn activate(&self) -> Result<ActivationReport, WorkerError> {
    self.transition(WorkerState::Activating)?;
    info!(cache = %self.config.shell_cache_name, "Activating worker");

    let names = match self.storage.cache_names().await {
      Ok(names) => names,
      Err(e) => {
        error!(error = %e, "Failed to list caches; skipping cleanup");
        Vec::new()
      }
    };

    let stale: Vec<String> = names
      .into_iter()
      .filter(|name| !self.config.keeps(name))
      .collect();

    if stale.is_empty() {
      info!("No old caches to clean up");
    } else {
      info!(count = stale.len(), "Cleaning up old caches");
    }

    let deletions = stale.iter().map(|name| async move {
      info!(cache = %name, "Deleting old cache");
      match self.storage.delete_cache(name).await {
        Ok(_) => Ok(name.clone()),
        Err(e) => {
          warn!(cache = %name, error = %e, "Failed to delete old cache");
          Err(name.clone())
        }
      }
    });

    let mut report = ActivationReport::default();
    for outcome in join_all(deletions).await {
      match outcome {
        Ok(name) => report.purged.push(name),
        Err(name) => report.failed.push(name),
      }
    }

    self.transition(WorkerState::Activated)?;
    self.claim()?;
    info!("Activation completed");
    Ok(report)
  }

  /// Take control of all open pages without a reload.
  pub fn claim(&self) -> Result<(), WorkerError> {
    let mut lifecycle = self.lifecycle();
    if lifecycle.state != WorkerState::Activated {
      return Err(WorkerError::InvalidTransition {
        from: lifecycle.state,
        to: WorkerState::Activated,
      });
    }
    lifecycle.controlling = true;
    Ok(())
  }

  /// Bring the worker up for this process.
  ///
  /// Installs when the current generation's shell cache is missing;
  /// otherwise the earlier install is reused. Either way the worker activates
  /// (purging stale caches) and claims clients.
  pub async fn register(&self) -> Result<Registration, WorkerError> {
    if self.storage.has(&self.config.shell_cache_name).await? {
      debug!(cache = %self.config.shell_cache_name, "Shell cache present; resuming");
      self.transition(WorkerState::Installing)?;
      self.transition(WorkerState::Installed)?;
      let activation = self.activate().await?;
      return Ok(Registration::Resumed { activation });
    }

    let precached = self.install().await?;
    let activation = self.activate().await?;
    Ok(Registration::Installed {
      precached,
      activation,
    })
  }
}
