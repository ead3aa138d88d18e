//! Engine statistics names and traffic snapshots
//!
//! The engine reports counters as `kind>>>name>>>traffic>>>direction`, e.g.
//! `user>>>alice@example.com>>>traffic>>>uplink`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Inbound,
    Outbound,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

/// One decoded counter name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatName<'a> {
    pub kind: StatKind,
    pub name: &'a str,
    pub direction: Direction,
}

/// Decode a stat name; anything outside the traffic grammar yields `None`
pub fn parse_stat_name(raw: &str) -> Option<StatName<'_>> {
    let mut parts = raw.split(">>>");
    let kind = match parts.next()? {
        "inbound" => StatKind::Inbound,
        "outbound" => StatKind::Outbound,
        "user" => StatKind::User,
        _ => return None,
    };
    let name = parts.next().filter(|n| !n.is_empty())?;
    if parts.next()? != "traffic" {
        return None;
    }
    let direction = match parts.next()? {
        "uplink" => Direction::Uplink,
        "downlink" => Direction::Downlink,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(StatName {
        kind,
        name,
        direction,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub up: i64,
    pub down: i64,
}

impl Counter {
    pub fn is_zero(&self) -> bool {
        self.up == 0 && self.down == 0
    }
}

/// Deltas pulled from the engine in one clear-on-read query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub inbounds: HashMap<String, Counter>,
    pub outbounds: HashMap<String, Counter>,
    pub clients: HashMap<String, Counter>,
}

impl TrafficSnapshot {
    /// Build a snapshot from `(name, value)` pairs; unknown names are skipped
    pub fn from_stats<'a, I>(stats: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let mut snapshot = Self::default();
        for (raw, value) in stats {
            snapshot.add(raw, value);
        }
        snapshot
    }

    /// Add one counter; returns false when the name is not a traffic stat
    pub fn add(&mut self, raw: &str, value: i64) -> bool {
        let Some(stat) = parse_stat_name(raw) else {
            return false;
        };
        let map = match stat.kind {
            StatKind::Inbound => &mut self.inbounds,
            StatKind::Outbound => &mut self.outbounds,
            StatKind::User => &mut self.clients,
        };
        let counter = map.entry(stat.name.to_string()).or_default();
        match stat.direction {
            Direction::Uplink => counter.up += value,
            Direction::Downlink => counter.down += value,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.inbounds.is_empty() && self.outbounds.is_empty() && self.clients.is_empty()
    }

    /// Clients that moved traffic in this snapshot, sorted
    pub fn active_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, counter)| !counter.is_zero())
            .map(|(email, _)| email.clone())
            .collect();
        clients.sort();
        clients
    }
}
