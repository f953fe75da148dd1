// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{
    expiry::{ExpiryQueue, GrantId},
    firewall::{AllowChain, FirewallGrant},
};
use portknock_conf::ServiceConfig;
use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Knock progress of one source address.
#[derive(Clone, Copy, Debug)]
struct KnockState {
    /// Next expected position in the knock sequence.
    seq_index: usize,
    /// Instant of the last accepted progress packet.
    last_time: Instant,
    /// Instant the current grant expires, or `None` if never granted.
    allowed_until: Option<Instant>,
}

/// Per-service knock state machine.
///
/// Holds the `source address -> KnockState` map of one service and
/// drives all transitions on observed packets. Completion installs
/// the allow rule through the firewall and registers the grant with
/// the expiry queue.
pub struct KnockEngine<F> {
    service: ServiceConfig,
    chain: AllowChain,
    fw: Arc<Mutex<F>>,
    expiry: Arc<ExpiryQueue>,
    states: Mutex<HashMap<Ipv4Addr, KnockState>>,
}

impl<F: FirewallGrant> KnockEngine<F> {
    pub fn new(
        service: ServiceConfig,
        chain: AllowChain,
        fw: Arc<Mutex<F>>,
        expiry: Arc<ExpiryQueue>,
    ) -> Self {
        Self {
            service,
            chain,
            fw,
            expiry,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Install allow rules for all whitelisted addresses.
    /// Whitelist grants never expire, so none of them is registered
    /// with the expiry queue.
    pub async fn grant_whitelist(&self) {
        for &addr in &self.service.whitelist {
            let mut fw = self.fw.lock().await;
            match fw
                .allow(&self.service.name, addr, self.service.allow_port, &self.chain)
                .await
            {
                Ok(()) => {
                    info!("[{}] whitelisted {addr}", self.service.name);
                }
                Err(e) => {
                    error!("[{}] failed to whitelist {addr}: {e:#}", self.service.name);
                }
            }
        }
    }

    /// Handle one observed packet addressed to a relevant port.
    pub async fn on_packet(&self, src: Ipv4Addr, dst_port: u16) {
        self.on_packet_at(src, dst_port, Instant::now()).await;
    }

    async fn on_packet_at(&self, src: Ipv4Addr, dst_port: u16, now: Instant) {
        if dst_port == self.service.allow_port {
            self.check_direct_access(src, now).await;
        } else if self.service.is_knock_port(dst_port) {
            self.handle_knock(src, dst_port, now).await;
        } else {
            let mut states = self.states.lock().await;
            self.reset_unrelated_locked(&mut states, src, dst_port, now);
        }
    }

    /// Anti-probe path for packets to ports unrelated to this service.
    /// Callable from the capture thread.
    pub fn reset_if_unrelated(&self, src: Ipv4Addr, dst_port: u16) {
        let mut states = self.states.blocking_lock();
        self.reset_unrelated_locked(&mut states, src, dst_port, Instant::now());
    }

    /// A packet to the protected port itself never advances the
    /// sequence. Without an active grant it only earns a warning;
    /// the kernel drop rule is what actually rejects it.
    async fn check_direct_access(&self, src: Ipv4Addr, now: Instant) {
        let states = self.states.lock().await;
        let granted = states
            .get(&src)
            .and_then(|state| state.allowed_until)
            .is_some_and(|until| now < until);
        if !granted {
            warn!(
                "[{}] {src} attempted direct access to protected port {}",
                self.service.name, self.service.allow_port
            );
        }
    }

    async fn handle_knock(&self, src: Ipv4Addr, dst_port: u16, now: Instant) {
        let mut states = self.states.lock().await;

        // Start from scratch if there is no record yet or the whole
        // attempt went stale. Elapsed time equal to the window still
        // counts as progress; only strictly greater is stale.
        let mut state = match states.get(&src) {
            Some(state)
                if now.duration_since(state.last_time) <= self.service.grant_duration() =>
            {
                *state
            }
            _ => KnockState {
                seq_index: 0,
                last_time: now,
                allowed_until: None,
            },
        };

        let expected = self.service.knock_ports[state.seq_index];
        if dst_port != expected {
            if state.seq_index > 0 {
                warn!(
                    "[{}] {src} wrong knock on port {dst_port}, expected {expected}; sequence reset",
                    self.service.name
                );
                state.seq_index = 0;
                state.last_time = now;
                states.insert(src, state);
            }
            // A mismatch at position 0 leaves the record absent or unchanged.
            return;
        }

        state.seq_index += 1;
        state.last_time = now;
        info!(
            "[{}] {src} matched knock step {}/{} (port {dst_port})",
            self.service.name,
            state.seq_index,
            self.service.knock_ports.len()
        );

        if state.seq_index == self.service.knock_ports.len() {
            let until = now + self.service.grant_duration();
            state.allowed_until = Some(until);
            state.seq_index = 0;
            info!(
                "[{}] {src} completed the knock sequence; granting port {} for {:?}",
                self.service.name,
                self.service.allow_port,
                self.service.grant_duration()
            );

            let allowed = {
                let mut fw = self.fw.lock().await;
                fw.allow(&self.service.name, src, self.service.allow_port, &self.chain)
                    .await
            };
            match allowed {
                Ok(()) => {
                    let id = GrantId {
                        service: self.service.name.clone(),
                        addr: src,
                        port: self.service.allow_port,
                    };
                    self.expiry.schedule(id, until).await;
                }
                Err(e) => {
                    // The grant window stays recorded, but a rule that
                    // never reached the kernel gets no expiry entry.
                    error!(
                        "[{}] failed to install allow rule for {src}: {e:#}",
                        self.service.name
                    );
                }
            }
        }
        states.insert(src, state);
    }

    fn reset_unrelated_locked(
        &self,
        states: &mut HashMap<Ipv4Addr, KnockState>,
        src: Ipv4Addr,
        dst_port: u16,
        now: Instant,
    ) {
        if dst_port == self.service.allow_port || self.service.is_knock_port(dst_port) {
            return;
        }
        let Some(state) = states.get_mut(&src) else {
            return;
        };
        match state.allowed_until {
            Some(until) if now < until => {
                // Within the grant window only the sequence progress
                // is cleared; the grant itself stays valid.
                state.seq_index = 0;
                warn!(
                    "[{}] {src} touched unrelated port {dst_port} during an active grant; sequence reset",
                    self.service.name
                );
            }
            _ => {
                states.remove(&src);
                error!(
                    "[{}] {src} touched unrelated port {dst_port} without an active grant; knock state dropped",
                    self.service.name
                );
            }
        }
    }

    #[cfg(test)]
    async fn seq_index_of(&self, src: Ipv4Addr) -> Option<usize> {
        self.states.lock().await.get(&src).map(|s| s.seq_index)
    }

    #[cfg(test)]
    async fn allowed_until_of(&self, src: Ipv4Addr) -> Option<Instant> {
        self.states.lock().await.get(&src).and_then(|s| s.allowed_until)
    }

    #[cfg(test)]
    async fn has_state(&self, src: Ipv4Addr) -> bool {
        self.states.lock().await.contains_key(&src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{self as ah, format_err as err};
    use portknock_conf::Config;
    use std::time::Duration;

    #[derive(Default)]
    struct MockFirewall {
        allows: Vec<(String, Ipv4Addr, u16, String)>,
        revokes: Vec<(String, Ipv4Addr, u16)>,
        fail_allow: bool,
    }

    impl FirewallGrant for MockFirewall {
        async fn allow(
            &mut self,
            service: &str,
            addr: Ipv4Addr,
            port: u16,
            chain: &AllowChain,
        ) -> ah::Result<()> {
            if self.fail_allow {
                return Err(err!("allow failed"));
            }
            self.allows
                .push((service.to_string(), addr, port, chain.name().to_string()));
            Ok(())
        }

        async fn revoke(
            &mut self,
            service: &str,
            addr: Ipv4Addr,
            port: u16,
            _chain: &AllowChain,
        ) -> ah::Result<()> {
            self.revokes.push((service.to_string(), addr, port));
            Ok(())
        }
    }

    const SERVICE_YAML: &str = "\
services:
  - name: S
    interface: eth0
    knock_ports: [1000, 2000, 3000]
    allow_port: 22
    expire_seconds: 60
";

    fn engine() -> KnockEngine<MockFirewall> {
        engine_from_yaml(SERVICE_YAML)
    }

    fn engine_from_yaml(yaml: &str) -> KnockEngine<MockFirewall> {
        let config = Config::parse(yaml).unwrap();
        let service = config.services[0].clone();
        let chain = AllowChain::new(&service.name);
        KnockEngine::new(
            service,
            chain,
            Arc::new(Mutex::new(MockFirewall::default())),
            Arc::new(ExpiryQueue::new()),
        )
    }

    fn src() -> Ipv4Addr {
        "10.0.0.5".parse().unwrap()
    }

    fn grant_id(engine: &KnockEngine<MockFirewall>) -> GrantId {
        GrantId {
            service: engine.service.name.clone(),
            addr: src(),
            port: engine.service.allow_port,
        }
    }

    async fn knock_all(engine: &KnockEngine<MockFirewall>, start: Instant) {
        let ports: Vec<u16> = engine.service.knock_ports.clone();
        for (i, port) in ports.into_iter().enumerate() {
            engine
                .on_packet_at(src(), port, start + Duration::from_secs(i as u64))
                .await;
        }
    }

    #[tokio::test]
    async fn full_sequence_installs_allow_rule_and_schedules_expiry() {
        let engine = engine();
        let t0 = Instant::now();

        knock_all(&engine, t0).await;

        let fw = engine.fw.lock().await;
        assert_eq!(
            fw.allows,
            [("S".to_string(), src(), 22, "S_allow".to_string())]
        );
        drop(fw);

        // The grant expires one window after the final knock.
        let completion = t0 + Duration::from_secs(2);
        assert_eq!(
            engine.expiry.deadline(&grant_id(&engine)).await,
            Some(completion + Duration::from_secs(60))
        );

        // The index never persists at full length.
        assert_eq!(engine.seq_index_of(src()).await, Some(0));
        assert_eq!(
            engine.allowed_until_of(src()).await,
            Some(completion + Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn wrong_knock_resets_progress() {
        let engine = engine();
        let t0 = Instant::now();

        engine.on_packet_at(src(), 1000, t0).await;
        engine
            .on_packet_at(src(), 3000, t0 + Duration::from_secs(1))
            .await;

        assert_eq!(engine.seq_index_of(src()).await, Some(0));
        assert!(engine.fw.lock().await.allows.is_empty());
    }

    #[tokio::test]
    async fn mismatch_at_position_zero_leaves_no_record() {
        let engine = engine();

        // 2000 is a knock port, but not the first one.
        engine.on_packet_at(src(), 2000, Instant::now()).await;

        assert!(!engine.has_state(src()).await);
    }

    #[tokio::test]
    async fn stale_attempt_restarts_from_scratch() {
        let engine = engine();
        let t0 = Instant::now();

        engine.on_packet_at(src(), 1000, t0).await;
        engine
            .on_packet_at(src(), 2000, t0 + Duration::from_secs(1))
            .await;

        // Much later than the 60 s window: the old progress is stale,
        // and the first knock port starts a fresh sequence at index 1.
        engine
            .on_packet_at(src(), 1000, t0 + Duration::from_secs(300))
            .await;
        assert_eq!(engine.seq_index_of(src()).await, Some(1));
    }

    #[tokio::test]
    async fn knock_exactly_at_window_edge_is_progress() {
        let engine = engine();
        let t0 = Instant::now();

        engine.on_packet_at(src(), 1000, t0).await;
        // Inclusive boundary: elapsed == grant_duration still progresses.
        engine
            .on_packet_at(src(), 2000, t0 + Duration::from_secs(60))
            .await;

        assert_eq!(engine.seq_index_of(src()).await, Some(2));
    }

    #[tokio::test]
    async fn recompletion_extends_grant_and_moves_one_deadline() {
        let engine = engine();
        let t0 = Instant::now();

        knock_all(&engine, t0).await;
        knock_all(&engine, t0 + Duration::from_secs(30)).await;

        // Both completions called into the firewall; rule idempotence
        // is the firewall's job.
        assert_eq!(engine.fw.lock().await.allows.len(), 2);

        // One queue entry, moved to the second completion's deadline.
        let second_completion = t0 + Duration::from_secs(32);
        assert_eq!(engine.expiry.len().await, 1);
        assert_eq!(
            engine.expiry.deadline(&grant_id(&engine)).await,
            Some(second_completion + Duration::from_secs(60))
        );
        assert_eq!(
            engine.allowed_until_of(src()).await,
            Some(second_completion + Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn direct_access_creates_no_state() {
        let engine = engine();

        engine.on_packet_at(src(), 22, Instant::now()).await;

        assert!(!engine.has_state(src()).await);
        assert!(engine.fw.lock().await.allows.is_empty());
    }

    #[tokio::test]
    async fn unrelated_port_during_grant_resets_sequence_only() {
        let engine = engine();
        let t0 = Instant::now();

        knock_all(&engine, t0).await;
        let granted_until = engine.allowed_until_of(src()).await;

        // Mid-grant progress on a fresh sequence...
        engine
            .on_packet_at(src(), 1000, t0 + Duration::from_secs(10))
            .await;
        assert_eq!(engine.seq_index_of(src()).await, Some(1));

        // ...is wiped by an unrelated port, but the grant survives.
        engine
            .on_packet_at(src(), 9999, t0 + Duration::from_secs(11))
            .await;
        assert_eq!(engine.seq_index_of(src()).await, Some(0));
        assert_eq!(engine.allowed_until_of(src()).await, granted_until);
    }

    #[tokio::test]
    async fn unrelated_port_after_expiry_drops_the_state() {
        let engine = engine();
        let t0 = Instant::now();

        knock_all(&engine, t0).await;

        // The grant ran out long ago.
        engine
            .on_packet_at(src(), 9999, t0 + Duration::from_secs(600))
            .await;
        assert!(!engine.has_state(src()).await);
    }

    #[tokio::test]
    async fn unrelated_port_without_state_is_a_noop() {
        let engine = engine();

        engine.on_packet_at(src(), 9999, Instant::now()).await;

        assert!(!engine.has_state(src()).await);
    }

    #[tokio::test]
    async fn failed_allow_records_grant_but_schedules_no_expiry() {
        let engine = engine();
        engine.fw.lock().await.fail_allow = true;
        let t0 = Instant::now();

        knock_all(&engine, t0).await;

        assert_eq!(engine.seq_index_of(src()).await, Some(0));
        assert!(engine.allowed_until_of(src()).await.is_some());
        assert_eq!(engine.expiry.len().await, 0);
    }

    #[tokio::test]
    async fn whitelist_grants_all_addresses_without_expiry() {
        let engine = engine_from_yaml(
            "\
services:
  - name: S
    interface: eth0
    knock_ports: [1000]
    allow_port: 22
    whitelist: [10.0.0.1, 10.0.0.2]
",
        );

        engine.grant_whitelist().await;

        let fw = engine.fw.lock().await;
        assert_eq!(fw.allows.len(), 2);
        drop(fw);
        assert_eq!(engine.expiry.len().await, 0);
    }
}

// vim: ts=4 sw=4 expandtab
