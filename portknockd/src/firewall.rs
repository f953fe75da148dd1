// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

pub mod nftables;

use anyhow as ah;
use std::net::Ipv4Addr;

/// Handle to a per-service allow sub-chain.
///
/// The chain holds the per-source accept rules of one service and is
/// reachable only through the jump rule in the main input chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowChain {
    name: String,
}

impl AllowChain {
    pub(crate) fn new(service: &str) -> Self {
        Self {
            name: format!("{service}_allow"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for AllowChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.name)
    }
}

/// Key in the allow rule bookkeeping map.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct RuleKey {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Grant operations consumed by the knock state engine.
pub trait FirewallGrant {
    /// Add a rule to the service sub-chain that opens `port` for `addr`.
    /// This operation shall handle the case where there already is such
    /// a rule present gracefully.
    async fn allow(
        &mut self,
        service: &str,
        addr: Ipv4Addr,
        port: u16,
        chain: &AllowChain,
    ) -> ah::Result<()>;

    /// Remove the rule(s) opening `port` for `addr` from the service sub-chain.
    /// This operation shall handle the case where there is no such rule
    /// present gracefully.
    async fn revoke(
        &mut self,
        service: &str,
        addr: Ipv4Addr,
        port: u16,
        chain: &AllowChain,
    ) -> ah::Result<()>;
}


// vim: ts=4 sw=4 expandtab
