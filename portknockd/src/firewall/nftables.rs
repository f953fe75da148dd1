// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::firewall::{AllowChain, FirewallGrant, RuleKey};
use anyhow::{self as ah, format_err as err, Context as _};
use nftables::{
    batch::Batch,
    expr::{Expression, NamedExpression, Payload},
    helper::{apply_ruleset, get_current_ruleset},
    schema::{Chain, FlushObject, NfCmd, NfListObject, NfObject, Rule, Table},
    stmt::{JumpTarget, Match, Operator, Statement},
    types::{NfChainPolicy, NfChainType, NfFamily, NfHook},
};
use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
};
use tracing::{debug, info};

const FAMILY: NfFamily = NfFamily::INet;
const TABLE: &str = "portknock";
const CHAIN_INPUT: &str = "pkinput";

/// TCP or UDP port number.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FilterPort {
    /// TCP port.
    Tcp(u16),
    /// UDP port.
    Udp(u16),
}

impl std::fmt::Display for FilterPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Tcp(p) => write!(f, "{p}/TCP"),
            Self::Udp(p) => write!(f, "{p}/UDP"),
        }
    }
}

/// Create an nftables IPv4 source address match statement.
fn statement_match_saddr(addr: Ipv4Addr) -> Statement {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload {
            protocol: "ip".to_string(),
            field: "saddr".to_string(),
        })),
        right: Expression::String(addr.to_string()),
        op: Operator::EQ,
    })
}

/// Create an nftables destination port match statement.
fn statement_match_dport(port: FilterPort) -> Statement {
    let (protocol, port) = match port {
        FilterPort::Tcp(port) => ("tcp".to_string(), port),
        FilterPort::Udp(port) => ("udp".to_string(), port),
    };
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload {
            protocol,
            field: "dport".to_string(),
        })),
        right: Expression::Number(port.into()),
        op: Operator::EQ,
    })
}

/// Create an nftables `accept` statement.
fn statement_accept() -> Statement {
    Statement::Accept(None)
}

/// Create an nftables `drop` statement.
fn statement_drop() -> Statement {
    Statement::Drop(None)
}

/// Identification comment for an allow rule.
///
/// Rules staged by this process carry it verbatim; idempotence of
/// grant and revoke is driven by prefix matching against it.
fn gen_rule_comment(service: &str, addr: Ipv4Addr, port: u16) -> String {
    format!("service:{service},ip:{addr},port:{port}")
}

/// An empty rule object referring to `chain` in our table.
fn rule_skeleton(chain: &str) -> Rule {
    Rule::new(FAMILY, TABLE.to_string(), chain.to_string(), vec![])
}

struct ListedRuleset {
    objs: Vec<NfObject>,
}

impl ListedRuleset {
    /// Get the active ruleset from the kernel.
    pub fn from_kernel() -> ah::Result<Self> {
        let ruleset = get_current_ruleset(
            None, // program
            None, // args
        )?;
        Ok(Self {
            objs: ruleset.objects,
        })
    }

    /// Check whether our table exists in the kernel ruleset.
    fn has_table(&self) -> bool {
        self.objs.iter().any(|obj| match obj {
            NfObject::ListObject(obj) => matches!(
                obj,
                NfListObject::Table(Table {
                    family,
                    name,
                    ..
                }) if family == &FAMILY && name == TABLE
            ),
            _ => false,
        })
    }

    /// Check whether a chain with the given name exists in our table.
    fn has_chain(&self, chain: &str) -> bool {
        self.objs.iter().any(|obj| match obj {
            NfObject::ListObject(obj) => matches!(
                obj,
                NfListObject::Chain(Chain {
                    family,
                    table,
                    name,
                    ..
                }) if family == &FAMILY && table == TABLE && name == chain
            ),
            _ => false,
        })
    }

    /// Get the handles of all rules in `chain` whose comment
    /// starts with `prefix`.
    fn rule_handles_by_comment(&self, chain: &str, prefix: &str) -> Vec<u32> {
        let mut handles = vec![];
        for obj in &self.objs {
            if let NfObject::ListObject(obj) = obj {
                match obj {
                    NfListObject::Rule(Rule {
                        family,
                        table,
                        chain: rule_chain,
                        handle: Some(handle),
                        comment: Some(comment),
                        ..
                    }) if family == &FAMILY
                        && table == TABLE
                        && rule_chain == chain
                        && comment.starts_with(prefix) =>
                    {
                        handles.push(*handle);
                    }
                    _ => (),
                }
            }
        }
        handles
    }
}

/// Firewall handler backed by the kernel nftables subsystem.
///
/// All rule mutations are staged into a batch and committed with a
/// single atomic apply. The instance is shared behind one mutex, so
/// kernel interactions are fully serialized.
pub struct NftFirewall {
    /// Comment of the installed allow rule, per `(addr, port)`.
    rules: HashMap<RuleKey, String>,
    /// Ports for which block rules have been installed since process start.
    blocked_ports: HashSet<u16>,
}

impl NftFirewall {
    /// Create a new firewall handler instance.
    ///
    /// Removes a stale `portknock` table from a previous run and
    /// creates the table and the main input chain from scratch.
    pub async fn new() -> ah::Result<Self> {
        // Test if the `nft` binary is available.
        if let Err(e) = std::process::Command::new("nft").args(["--help"]).output() {
            return Err(err!(
                "Failed to execute the 'nft' program.\n\
                Did you install the 'nftables' support package in your distribution's package manager?\n\
                Is the 'nft' binary available in the $PATH?\n\
                The execution error was: {e}"
            ));
        }

        let mut this = Self {
            rules: HashMap::new(),
            blocked_ports: HashSet::new(),
        };

        this.initialize().context("nftables initialization")?;

        Ok(this)
    }

    /// Apply a rules batch to the kernel.
    fn apply_batch(&self, batch: Batch) -> ah::Result<()> {
        let ruleset = batch.to_nftables();
        apply_ruleset(
            &ruleset, // rules
            None,     // program
            None,     // args
        )
        .context("Apply nftables")?;
        Ok(())
    }

    /// Drop a pre-existing table, then re-create the table and
    /// the main input chain with accept policy.
    fn initialize(&mut self) -> ah::Result<()> {
        let ruleset = ListedRuleset::from_kernel()?;
        if ruleset.has_table() {
            let mut batch = Batch::new();
            batch.add_cmd(NfCmd::Delete(NfListObject::Table(Table::new(
                FAMILY,
                TABLE.to_string(),
            ))));
            self.apply_batch(batch)
                .context("Delete stale portknock table")?;
            debug!("nftables: Stale table removed");
        }

        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Add(NfListObject::Table(Table::new(
            FAMILY,
            TABLE.to_string(),
        ))));
        batch.add_cmd(NfCmd::Add(NfListObject::Chain(Chain::new(
            FAMILY,
            TABLE.to_string(),
            CHAIN_INPUT.to_string(),
            Some(NfChainType::Filter),
            Some(NfHook::Input),
            Some(0),
            None,
            Some(NfChainPolicy::Accept),
        ))));
        self.apply_batch(batch).context("Create table and chain")?;

        info!("nftables: Table '{TABLE}' and chain '{CHAIN_INPUT}' created");
        Ok(())
    }

    /// Create the allow sub-chain of a service and insert the jump
    /// rule for its protected port at the head of the main chain.
    ///
    /// A leftover chain of the same name is removed first.
    pub fn create_allow_chain(&mut self, service: &str, port: u16) -> ah::Result<AllowChain> {
        let chain = AllowChain::new(service);

        let ruleset = ListedRuleset::from_kernel()?;
        if ruleset.has_chain(chain.name()) {
            let mut batch = Batch::new();
            batch.add_cmd(NfCmd::Flush(FlushObject::Chain(Chain::new(
                FAMILY,
                TABLE.to_string(),
                chain.name().to_string(),
                None,
                None,
                None,
                None,
                None,
            ))));
            batch.add_cmd(NfCmd::Delete(NfListObject::Chain(Chain::new(
                FAMILY,
                TABLE.to_string(),
                chain.name().to_string(),
                None,
                None,
                None,
                None,
                None,
            ))));
            self.apply_batch(batch).context("Delete stale allow chain")?;
        }

        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Add(NfListObject::Chain(Chain::new(
            FAMILY,
            TABLE.to_string(),
            chain.name().to_string(),
            Some(NfChainType::Filter),
            None,
            None,
            None,
            None,
        ))));

        // The jump must be evaluated before the drop rules of the
        // protected port, so it goes to the head of the main chain.
        let mut rule = rule_skeleton(CHAIN_INPUT);
        rule.expr = vec![
            statement_match_dport(FilterPort::Tcp(port)),
            Statement::Jump(JumpTarget {
                target: chain.name().to_string(),
            }),
        ];
        rule.comment = Some(format!("jump-{}", chain.name()));
        batch.add_cmd(NfCmd::Insert(NfListObject::Rule(rule)));

        self.apply_batch(batch).context("Create allow chain")?;

        info!("nftables: Chain '{chain}' created for port {port}");
        Ok(chain)
    }

    /// Install the TCP and UDP drop rules gating `port` in the main chain.
    /// Calling this again for the same port is a no-op.
    pub fn add_block(&mut self, service: &str, port: u16) -> ah::Result<()> {
        if self.blocked_ports.contains(&port) {
            return Ok(());
        }

        let mut batch = Batch::new();
        for fport in [FilterPort::Tcp(port), FilterPort::Udp(port)] {
            let mut rule = rule_skeleton(CHAIN_INPUT);
            rule.expr = vec![statement_match_dport(fport), statement_drop()];
            batch.add_cmd(NfCmd::Add(NfListObject::Rule(rule)));
            debug!("nftables: block rule staged for {fport}");
        }
        self.apply_batch(batch).context("Add block rules")?;

        self.blocked_ports.insert(port);
        info!("nftables: [{service}] port {port} blocked by default");
        Ok(())
    }
}

impl FirewallGrant for NftFirewall {
    /// Add an accept rule for `(addr, port)` to the service sub-chain.
    /// If the rule is already installed, nothing is changed.
    async fn allow(
        &mut self,
        service: &str,
        addr: Ipv4Addr,
        port: u16,
        chain: &AllowChain,
    ) -> ah::Result<()> {
        let key = RuleKey { addr, port };
        let comment = gen_rule_comment(service, addr, port);

        let ruleset = ListedRuleset::from_kernel()?;
        if !ruleset
            .rule_handles_by_comment(chain.name(), &comment)
            .is_empty()
        {
            debug!("nftables: [{service}] allow rule for {addr} already installed");
            return Ok(());
        }

        let mut batch = Batch::new();

        // A tracked rule that the listing no longer matches exactly is
        // stale. Stage its deletion before adding the replacement.
        if let Some(old_comment) = self.rules.remove(&key) {
            for handle in ruleset.rule_handles_by_comment(chain.name(), &old_comment) {
                let mut rule = rule_skeleton(chain.name());
                rule.handle = Some(handle);
                batch.add_cmd(NfCmd::Delete(NfListObject::Rule(rule)));
            }
        }

        let mut rule = rule_skeleton(chain.name());
        rule.expr = vec![
            statement_match_saddr(addr),
            statement_match_dport(FilterPort::Tcp(port)),
            statement_accept(),
        ];
        rule.comment = Some(comment.clone());
        batch.add_cmd(NfCmd::Add(NfListObject::Rule(rule)));

        self.apply_batch(batch).context("Add allow rule")?;

        self.rules.insert(key, comment);
        info!("nftables: [{service}] allow rule added: {addr} -> {port}");
        Ok(())
    }

    /// Remove the accept rule(s) for `(addr, port)` from the service
    /// sub-chain. A missing rule is not an error.
    async fn revoke(
        &mut self,
        service: &str,
        addr: Ipv4Addr,
        port: u16,
        chain: &AllowChain,
    ) -> ah::Result<()> {
        self.rules.remove(&RuleKey { addr, port });

        let comment = gen_rule_comment(service, addr, port);
        let ruleset = ListedRuleset::from_kernel()?;
        let handles = ruleset.rule_handles_by_comment(chain.name(), &comment);
        if handles.is_empty() {
            debug!("nftables: [{service}] no allow rule for {addr}:{port} to revoke");
            return Ok(());
        }

        let mut batch = Batch::new();
        for handle in handles {
            let mut rule = rule_skeleton(chain.name());
            rule.handle = Some(handle);
            batch.add_cmd(NfCmd::Delete(NfListObject::Rule(rule)));
        }
        self.apply_batch(batch).context("Delete allow rule")?;

        info!("nftables: [{service}] allow rule revoked: {addr} -> {port}");
        Ok(())
    }
}


// vim: ts=4 sw=4 expandtab
