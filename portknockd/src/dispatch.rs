// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::Engine;
use anyhow::{self as ah, Context as _};
use etherparse::{IpHeader, PacketHeaders, TransportHeader};
use pcap::Capture;
use std::{net::Ipv4Addr, sync::Arc};
use tokio::runtime::Handle;
use tracing::info;

/// Capture frame size.
const SNAPLEN: i32 = 65536;

/// Capture read timeout, so the loop wakes up even on a silent link.
const READ_TIMEOUT_MS: i32 = 500;

/// Blocking capture loop of one interface.
///
/// Every inbound IPv4 TCP-SYN or UDP packet is routed to all services
/// bound to the interface: relevant destination ports are dispatched
/// as `on_packet` tasks, everything else goes through the synchronous
/// anti-probe reset.
///
/// Runs until the capture handle reports an error.
pub fn capture_loop(interface: &str, engines: Vec<Arc<Engine>>, handle: Handle) -> ah::Result<()> {
    let mut capture = Capture::from_device(interface)
        .context("Open capture device")?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .context("Activate capture")?;

    info!(
        "capture: listening on {interface} ({} service(s))",
        engines.len()
    );

    loop {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(e).context("Capture read"),
        };
        let Some((src, dst_port)) = parse_inbound(packet.data) else {
            continue;
        };
        for engine in &engines {
            let service = engine.service();
            if dst_port == service.allow_port || service.is_knock_port(dst_port) {
                let engine = Arc::clone(engine);
                handle.spawn(async move {
                    engine.on_packet(src, dst_port).await;
                });
            } else {
                engine.reset_if_unrelated(src, dst_port);
            }
        }
    }
}

/// Extract `(source address, destination port)` from an Ethernet frame.
///
/// Accepts IPv4 carrying either a TCP connection attempt (SYN set,
/// ACK clear) or any UDP datagram. Everything else, including frames
/// that do not parse, yields `None`.
fn parse_inbound(data: &[u8]) -> Option<(Ipv4Addr, u16)> {
    let headers = PacketHeaders::from_ethernet_slice(data).ok()?;
    let Some(IpHeader::Version4(ipv4, _)) = headers.ip else {
        return None;
    };
    let dst_port = match headers.transport? {
        TransportHeader::Tcp(tcp) if tcp.syn && !tcp.ack => tcp.destination_port,
        TransportHeader::Udp(udp) => udp.destination_port,
        _ => return None,
    };
    Some((Ipv4Addr::from(ipv4.source), dst_port))
}


// vim: ts=4 sw=4 expandtab
