// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::firewall::{AllowChain, FirewallGrant};
use std::{collections::HashMap, net::Ipv4Addr, time::Instant};
use tokio::sync::Mutex;
use tracing::{error, info};

/// Identity of one grant.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct GrantId {
    pub service: String,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Deadline map driving grant revocation.
///
/// Every grant has at most one deadline: re-granting overwrites the
/// deadline in place instead of stacking timers, so a revocation can
/// only ever fire for the latest grant of a source address.
pub struct ExpiryQueue {
    deadlines: Mutex<HashMap<GrantId, Instant>>,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule (or move) the revocation deadline of a grant.
    pub async fn schedule(&self, id: GrantId, deadline: Instant) {
        self.deadlines.lock().await.insert(id, deadline);
    }

    /// Remove and return all grants whose deadline has passed.
    async fn take_due(&self, now: Instant) -> Vec<GrantId> {
        let mut deadlines = self.deadlines.lock().await;
        let due: Vec<GrantId> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            deadlines.remove(id);
        }
        due
    }

    /// Revoke all expired grants.
    /// This shall be called in regular intervals.
    ///
    /// Revocation failures are logged and the grant is dropped;
    /// there is no retry.
    pub async fn maintain<F: FirewallGrant>(&self, fw: &Mutex<F>) {
        self.maintain_at(fw, Instant::now()).await;
    }

    async fn maintain_at<F: FirewallGrant>(&self, fw: &Mutex<F>, now: Instant) {
        for id in self.take_due(now).await {
            let chain = AllowChain::new(&id.service);
            let mut fw = fw.lock().await;
            match fw.revoke(&id.service, id.addr, id.port, &chain).await {
                Ok(()) => {
                    info!(
                        "[{}] grant for {} expired; allow rule revoked",
                        id.service, id.addr
                    );
                }
                Err(e) => {
                    error!(
                        "[{}] failed to revoke expired grant for {}: {e:#}",
                        id.service, id.addr
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn deadline(&self, id: &GrantId) -> Option<Instant> {
        self.deadlines.lock().await.get(id).copied()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.deadlines.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{self as ah, format_err as err};
    use std::time::Duration;

    #[derive(Default)]
    struct MockFirewall {
        revokes: Vec<(String, Ipv4Addr, u16)>,
        fail: bool,
    }

    impl FirewallGrant for MockFirewall {
        async fn allow(
            &mut self,
            _service: &str,
            _addr: Ipv4Addr,
            _port: u16,
            _chain: &AllowChain,
        ) -> ah::Result<()> {
            Ok(())
        }

        async fn revoke(
            &mut self,
            service: &str,
            addr: Ipv4Addr,
            port: u16,
            _chain: &AllowChain,
        ) -> ah::Result<()> {
            if self.fail {
                return Err(err!("revoke failed"));
            }
            self.revokes.push((service.to_string(), addr, port));
            Ok(())
        }
    }

    fn grant_id() -> GrantId {
        GrantId {
            service: "S".to_string(),
            addr: "10.0.0.5".parse().unwrap(),
            port: 22,
        }
    }

    #[tokio::test]
    async fn rescheduling_moves_the_deadline_in_place() {
        let queue = ExpiryQueue::new();
        let now = Instant::now();

        queue.schedule(grant_id(), now + Duration::from_secs(60)).await;
        queue.schedule(grant_id(), now + Duration::from_secs(90)).await;

        assert_eq!(queue.len().await, 1);
        assert_eq!(
            queue.deadline(&grant_id()).await,
            Some(now + Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn maintain_revokes_only_due_grants() {
        let queue = ExpiryQueue::new();
        let fw = Mutex::new(MockFirewall::default());
        let now = Instant::now();

        queue.schedule(grant_id(), now + Duration::from_secs(60)).await;

        // Not yet due.
        queue.maintain_at(&fw, now + Duration::from_secs(59)).await;
        assert!(fw.lock().await.revokes.is_empty());
        assert_eq!(queue.len().await, 1);

        // Due exactly at the deadline.
        queue.maintain_at(&fw, now + Duration::from_secs(60)).await;
        {
            let fw = fw.lock().await;
            assert_eq!(
                fw.revokes,
                [("S".to_string(), "10.0.0.5".parse().unwrap(), 22)]
            );
        }
        assert_eq!(queue.len().await, 0);

        // A second maintenance pass has nothing left to do.
        queue.maintain_at(&fw, now + Duration::from_secs(120)).await;
        assert_eq!(fw.lock().await.revokes.len(), 1);
    }

    #[tokio::test]
    async fn failed_revocation_is_dropped_without_retry() {
        let queue = ExpiryQueue::new();
        let fw = Mutex::new(MockFirewall {
            fail: true,
            ..Default::default()
        });
        let now = Instant::now();

        queue.schedule(grant_id(), now).await;
        queue.maintain_at(&fw, now + Duration::from_secs(1)).await;

        assert_eq!(queue.len().await, 0);
    }
}

// vim: ts=4 sw=4 expandtab
