//! C1: the port allocator (spec.md §4.1). A candidate port is available
//! iff it passes, in order: (1) no live record references it, (2) no
//! Docker container has it bound, (3) the process can bind+close a TCP
//! listener on it within 1s. The allocator serializes its own
//! "check-3-then-return" segment per process with a `tokio::sync::Mutex`
//! so two concurrent callers in this process never return the same port;
//! cross-process safety relies on the bind test itself (spec.md §4.1
//! "Concurrency").

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::docker::{DockerClient, port_is_bindable};
use crate::error::PortError;

/// Blacklisted ports never returned, regardless of availability (spec.md
/// §4.1: "e.g., {3002, 3003}").
pub const DEFAULT_BLACKLIST: &[u16] = &[3002, 3003];

/// Queried once per allocation call (spec.md §4.1: "implementations may
/// cache it for the duration of a single allocation call").
pub trait RecordPortsCheck: Send + Sync {
  fn ports_in_use_by_records<'a>(
    &'a self,
  ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<HashSet<u16>>> + Send + 'a>>;
}

pub struct PortAllocator {
  range_start: u16,
  range_end: u16,
  blacklist: HashSet<u16>,
  docker: Arc<DockerClient>,
  records: Arc<dyn RecordPortsCheck>,
  /// Guards the critical section from a port being deemed available to
  /// it being handed back to the caller.
  critical_section: Mutex<()>,
}

impl PortAllocator {
  pub fn new(
    range_start: u16,
    range_end: u16,
    docker: Arc<DockerClient>,
    records: Arc<dyn RecordPortsCheck>,
  ) -> Self {
    Self {
      range_start,
      range_end,
      blacklist: DEFAULT_BLACKLIST.iter().copied().collect(),
      docker,
      records,
      critical_section: Mutex::new(()),
    }
  }

  pub async fn allocate_port(&self) -> Result<u16, PortError> {
    let _guard = self.critical_section.lock().await;
    let bound = self.docker.all_bound_host_ports().await?;
    let recorded = self.records.ports_in_use_by_records().await?;
    for port in self.range_start..=self.range_end {
      if self.is_candidate_available(port, &bound, &recorded).await {
        return Ok(port);
      }
    }
    Err(PortError::Exhausted { start: self.range_start, end: self.range_end })
  }

  /// Both `p` and `p+1` must independently pass all three checks (spec.md
  /// §4.1 "For pair allocation").
  pub async fn allocate_port_pair(&self) -> Result<(u16, u16), PortError> {
    let _guard = self.critical_section.lock().await;
    let bound = self.docker.all_bound_host_ports().await?;
    let recorded = self.records.ports_in_use_by_records().await?;
    let mut port = self.range_start;
    while port < self.range_end {
      let first_ok = self.is_candidate_available(port, &bound, &recorded).await;
      if first_ok {
        let second_ok = self.is_candidate_available(port + 1, &bound, &recorded).await;
        if second_ok {
          return Ok((port, port + 1));
        }
      }
      port += 1;
    }
    Err(PortError::Exhausted { start: self.range_start, end: self.range_end })
  }

  pub fn release_port(&self, _port: u16) {
    // Release is a no-op here: availability is re-derived from the
    // record store and the Docker daemon on every allocation call, there
    // is no allocator-local reservation table to clear (spec.md §4.1
    // describes release purely in terms of the caller's record update).
  }

  /// Same as `allocate_port`, additionally excluding `failed`.
  pub async fn find_alternative(&self, failed: u16) -> Result<u16, PortError> {
    let _guard = self.critical_section.lock().await;
    let bound = self.docker.all_bound_host_ports().await?;
    let recorded = self.records.ports_in_use_by_records().await?;
    for port in self.range_start..=self.range_end {
      if port == failed {
        continue;
      }
      if self.is_candidate_available(port, &bound, &recorded).await {
        return Ok(port);
      }
    }
    Err(PortError::Exhausted { start: self.range_start, end: self.range_end })
  }

  pub async fn is_available(&self, port: u16) -> bool {
    if self.blacklist.contains(&port) {
      return false;
    }
    let bound = match self.docker.all_bound_host_ports().await {
      Ok(b) => b,
      Err(_) => return false,
    };
    let recorded = match self.records.ports_in_use_by_records().await {
      Ok(r) => r,
      Err(_) => return false,
    };
    self.is_candidate_available(port, &bound, &recorded).await
  }

  async fn is_candidate_available(
    &self,
    port: u16,
    bound: &HashSet<u16>,
    recorded: &HashSet<u16>,
  ) -> bool {
    if self.blacklist.contains(&port) {
      return false;
    }
    if recorded.contains(&port) {
      return false;
    }
    if bound.contains(&port) {
      return false;
    }
    port_is_bindable(port).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blacklist_excludes_configured_ports() {
    let blacklist: HashSet<u16> = DEFAULT_BLACKLIST.iter().copied().collect();
    assert!(blacklist.contains(&3002));
    assert!(blacklist.contains(&3003));
    assert!(!blacklist.contains(&40000));
  }
}
