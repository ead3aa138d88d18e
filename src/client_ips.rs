//! In-memory client → source IP state shared by the streaming and batch paths

use crate::access_log::Observation;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

type IpTable = HashMap<String, DateTime<Local>>;

pub struct ClientIpState {
    clients: RwLock<HashMap<String, IpTable>>,
    max_ips_per_client: usize,
    max_clients: usize,
}

impl ClientIpState {
    pub fn new(max_ips_per_client: usize, max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_ips_per_client: max_ips_per_client.max(1),
            max_clients: max_clients.max(1),
        }
    }

    /// Record one sighting. Returns false when the client table is full.
    pub fn observe(&self, observation: &Observation, now: DateTime<Local>) -> bool {
        let seen_at = observation.seen_at.unwrap_or(now);
        let mut clients = self.clients.write();

        if !clients.contains_key(&observation.client) && clients.len() >= self.max_clients {
            debug!(client = %observation.client, "Client table full, observation dropped");
            return false;
        }

        let ips = clients.entry(observation.client.clone()).or_default();
        let entry = ips.entry(observation.ip.clone()).or_insert(seen_at);
        if seen_at > *entry {
            *entry = seen_at;
        }
        trim_oldest(ips, self.max_ips_per_client);
        true
    }

    pub fn observe_all<'a, I>(&self, observations: I, now: DateTime<Local>) -> usize
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        observations
            .into_iter()
            .filter(|obs| self.observe(obs, now))
            .count()
    }

    /// Merge persisted IPs for a client without overriding newer sightings
    pub fn seed(&self, client: &str, ips: &[String], at: DateTime<Local>) {
        if ips.is_empty() {
            return;
        }
        let mut clients = self.clients.write();
        if !clients.contains_key(client) && clients.len() >= self.max_clients {
            return;
        }
        let table = clients.entry(client.to_string()).or_default();
        for ip in ips {
            table.entry(ip.clone()).or_insert(at);
        }
        trim_oldest(table, self.max_ips_per_client);
    }

    /// Drop IPs not seen within `ttl`, then clients left without IPs
    pub fn evict_stale(&self, now: DateTime<Local>, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = now - ttl;

        let mut removed = 0;
        let mut clients = self.clients.write();
        clients.retain(|_, ips| {
            let before = ips.len();
            ips.retain(|_, seen| *seen >= cutoff);
            removed += before - ips.len();
            !ips.is_empty()
        });
        removed
    }

    /// Sorted IPs of one client
    pub fn ips_of(&self, client: &str) -> Vec<String> {
        let mut ips: Vec<String> = self
            .clients
            .read()
            .get(client)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        ips.sort();
        ips
    }

    /// Read-only copy of the whole state, IPs sorted per client
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.clients
            .read()
            .iter()
            .map(|(client, table)| {
                let mut ips: Vec<String> = table.keys().cloned().collect();
                ips.sort();
                (client.clone(), ips)
            })
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

fn trim_oldest(ips: &mut IpTable, max: usize) {
    while ips.len() > max {
        let oldest = ips
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(ip, _)| ip.clone());
        match oldest {
            Some(ip) => {
                ips.remove(&ip);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(client: &str, ip: &str, seen_at: Option<DateTime<Local>>) -> Observation {
        Observation {
            client: client.to_string(),
            ip: ip.to_string(),
            seen_at,
        }
    }

    #[test]
    fn test_observe_and_snapshot() {
        let state = ClientIpState::new(100, 5000);
        let now = Local::now();

        state.observe(&obs("alice", "203.0.113.5", None), now);
        state.observe(&obs("alice", "198.51.100.9", None), now);
        state.observe(&obs("alice", "203.0.113.5", None), now);
        state.observe(&obs("bob", "192.0.2.1", None), now);

        let snapshot = state.snapshot();
        assert_eq!(
            snapshot["alice"],
            vec!["198.51.100.9".to_string(), "203.0.113.5".to_string()]
        );
        assert_eq!(snapshot["bob"], vec!["192.0.2.1".to_string()]);
        assert_eq!(state.ips_of("nobody"), Vec::<String>::new());
    }

    #[test]
    fn test_per_client_cap_evicts_oldest() {
        let state = ClientIpState::new(2, 10);
        let now = Local::now();

        state.observe(&obs("alice", "10.0.0.1", Some(now - chrono::Duration::seconds(30))), now);
        state.observe(&obs("alice", "10.0.0.2", Some(now - chrono::Duration::seconds(20))), now);
        state.observe(&obs("alice", "10.0.0.3", Some(now - chrono::Duration::seconds(10))), now);

        assert_eq!(state.ips_of("alice"), vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_client_cap_drops_new_clients() {
        let state = ClientIpState::new(10, 1);
        let now = Local::now();

        assert!(state.observe(&obs("alice", "10.0.0.1", None), now));
        assert!(!state.observe(&obs("bob", "10.0.0.2", None), now));
        assert!(state.observe(&obs("alice", "10.0.0.3", None), now));
        assert_eq!(state.client_count(), 1);
    }

    #[test]
    fn test_evict_stale() {
        let state = ClientIpState::new(10, 10);
        let now = Local::now();

        state.observe(&obs("alice", "10.0.0.1", Some(now - chrono::Duration::hours(2))), now);
        state.observe(&obs("alice", "10.0.0.2", Some(now)), now);
        state.observe(&obs("bob", "10.0.0.3", Some(now - chrono::Duration::hours(3))), now);

        let removed = state.evict_stale(now, Duration::from_secs(1800));
        assert_eq!(removed, 2);
        assert_eq!(state.ips_of("alice"), vec!["10.0.0.2"]);
        assert_eq!(state.client_count(), 1);
    }

    #[test]
    fn test_seed_keeps_newer_sighting() {
        let state = ClientIpState::new(10, 10);
        let now = Local::now();
        let old = now - chrono::Duration::hours(1);

        state.observe(&obs("alice", "10.0.0.1", Some(now)), now);
        state.seed("alice", &["10.0.0.1".to_string(), "10.0.0.9".to_string()], old);

        assert_eq!(state.ips_of("alice"), vec!["10.0.0.1", "10.0.0.9"]);
        state.evict_stale(now, Duration::from_secs(60));
        assert_eq!(state.ips_of("alice"), vec!["10.0.0.1"]);
    }
}
