//! VM placement across cluster hosts.
//!
//! Input is a queue of [`QueuedVms`] batches (N names sharing one config)
//! and a snapshot of [`HostStats`]; output partitions every name onto a
//! host. Hosts are drawn from a min-priority-queue keyed on commit per
//! capacity for the chosen metric, with hosts at their VM limit treated as
//! infinitely loaded. Ties prefer hosts without pinned placements, then the
//! lexically-smallest host name, so a schedule is fully deterministic.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::vm::VmConfig;
use crate::{Error, Result};

/// A launch request: names to create plus the effective config they share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedVms {
    pub names: Vec<String>,
    pub config: VmConfig,
}

/// One candidate host's capacity snapshot at schedule time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    pub name: String,
    /// Usable CPUs.
    pub cpus: u64,
    /// Total memory in MB.
    pub mem_total: u64,
    /// Sum of vcpus across the host's VMs.
    pub cpu_commit: u64,
    pub mem_commit: u64,
    /// Sum of interface counts.
    pub net_commit: u64,
    pub vm_count: u64,
    /// Maximum VMs; -1 is unbounded.
    pub limit: i64,
}

impl HostStats {
    pub fn new(name: impl Into<String>, cpus: u64, mem_total: u64) -> Self {
        Self {
            name: name.into(),
            cpus,
            mem_total,
            cpu_commit: 0,
            mem_commit: 0,
            net_commit: 0,
            vm_count: 0,
            limit: -1,
        }
    }
}

/// Which commit counter the heap balances on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMetric {
    #[default]
    Cpu,
    Memory,
    Network,
}

impl std::str::FromStr for CommitMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(CommitMetric::Cpu),
            "memory" => Ok(CommitMetric::Memory),
            "network" => Ok(CommitMetric::Network),
            other => Err(Error::Validation(format!("unknown commit metric: {}", other))),
        }
    }
}

struct HostState {
    stats: HostStats,
    /// VMs placed on this host by pin or colocation in this run.
    pinned: u64,
    /// Max total VMs allowed, from the tightest coschedule placed so far.
    cap: Option<u64>,
}

impl HostState {
    fn total(&self) -> u64 {
        self.stats.vm_count
    }

    fn at_limit(&self) -> bool {
        self.stats.limit >= 0 && self.total() >= self.stats.limit as u64
    }

    /// Commit per capacity; infinitely loaded once at the VM limit.
    fn ratio(&self, metric: CommitMetric) -> f64 {
        if self.at_limit() {
            return f64::INFINITY;
        }
        let (commit, capacity) = match metric {
            CommitMetric::Cpu => (self.stats.cpu_commit, self.stats.cpus),
            CommitMetric::Memory => (self.stats.mem_commit, self.stats.mem_total),
            CommitMetric::Network => (self.stats.net_commit, self.stats.cpus),
        };
        commit as f64 / capacity.max(1) as f64
    }

    /// Whether a VM with this coschedule limit may land here.
    fn accepts(&self, coschedule: i64) -> bool {
        if self.at_limit() {
            return false;
        }
        if let Some(cap) = self.cap {
            if self.total() + 1 > cap {
                return false;
            }
        }
        // Peers after placement = current total; the new VM tolerates at
        // most `coschedule` of them.
        coschedule < 0 || self.total() <= coschedule as u64
    }

    fn place(&mut self, config: &VmConfig, pinned: bool) {
        self.stats.cpu_commit += config.vcpus as u64;
        self.stats.mem_commit += config.memory;
        self.stats.net_commit += config.networks.len() as u64;
        self.stats.vm_count += 1;
        if pinned {
            self.pinned += 1;
        }
        let k = config.hints.coschedule;
        if k >= 0 {
            let allowed = k as u64 + 1;
            self.cap = Some(self.cap.map_or(allowed, |c| c.min(allowed)));
        }
    }
}

/// Versioned min-heap entry; stale versions are skipped on pop.
struct HeapEntry {
    ratio: f64,
    pinned: u64,
    name: String,
    version: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Reversed: BinaryHeap is a max-heap, we want the least-loaded host.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ratio
            .total_cmp(&self.ratio)
            .then(other.pinned.cmp(&self.pinned))
            .then(other.name.cmp(&self.name))
    }
}

struct HostHeap {
    heap: BinaryHeap<HeapEntry>,
    versions: HashMap<String, u64>,
    metric: CommitMetric,
}

impl HostHeap {
    fn new(hosts: &HashMap<String, HostState>, metric: CommitMetric) -> Self {
        let mut this = Self {
            heap: BinaryHeap::new(),
            versions: HashMap::new(),
            metric,
        };
        for state in hosts.values() {
            this.update(state);
        }
        this
    }

    /// Re-key one host after a mutation.
    fn update(&mut self, state: &HostState) {
        let version = self.versions.entry(state.stats.name.clone()).or_insert(0);
        *version += 1;
        self.heap.push(HeapEntry {
            ratio: state.ratio(self.metric),
            pinned: state.pinned,
            name: state.stats.name.clone(),
            version: *version,
        });
    }

    /// Least-loaded host name, skipping stale entries.
    fn pop(&mut self) -> Option<String> {
        while let Some(entry) = self.heap.pop() {
            if self.versions.get(&entry.name) == Some(&entry.version) {
                // Consume the version so the host is out of the heap until
                // the next update.
                *self.versions.get_mut(&entry.name).unwrap() += 1;
                return Some(entry.name);
            }
        }
        None
    }
}

/// Compute a placement. The result maps host name to the QueuedVms
/// partitions it receives; the same N names appear across all partitions.
pub fn schedule(
    queue: &[QueuedVms],
    hosts: &[HostStats],
    metric: CommitMetric,
) -> Result<HashMap<String, Vec<QueuedVms>>> {
    if hosts.is_empty() {
        return Err(Error::Validation("no hosts to schedule onto".into()));
    }

    let mut states: HashMap<String, HostState> = hosts
        .iter()
        .map(|stats| {
            (
                stats.name.clone(),
                HostState {
                    stats: stats.clone(),
                    pinned: 0,
                    cap: None,
                },
            )
        })
        .collect();

    // Map every queued name to its entry for colocation resolution.
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (idx, entry) in queue.iter().enumerate() {
        for name in &entry.names {
            if owner.insert(name.as_str(), idx).is_some() {
                return Err(Error::Validation(format!("duplicate queued name {}", name)));
            }
        }
    }

    let pins = resolve_colocation(queue, &owner)?;

    // Hardest first: pinned, then tightest coschedule (0 hardest, -1
    // loosest), then widest batches.
    let mut order: Vec<usize> = (0..queue.len()).collect();
    order.sort_by(|&a, &b| {
        let entry = |i: usize| {
            let pinned = pins[i].is_some();
            let k = queue[i].config.hints.coschedule;
            let k = if k < 0 { i64::MAX } else { k };
            (std::cmp::Reverse(pinned), k, std::cmp::Reverse(queue[i].names.len()))
        };
        entry(a).cmp(&entry(b))
    });

    let mut heap = HostHeap::new(&states, metric);
    let mut placed_host: HashMap<String, String> = HashMap::new();
    let mut result: HashMap<String, Vec<QueuedVms>> = HashMap::new();
    let mut unplaced: Vec<String> = Vec::new();

    // Colocating entries wait for their target names to land.
    let mut deferred: Vec<usize> = Vec::new();

    for &idx in &order {
        let entry = &queue[idx];
        if entry.config.hints.colocate.is_some() && pins[idx].is_none() {
            deferred.push(idx);
            continue;
        }

        for name in &entry.names {
            let target = match &pins[idx] {
                Some(host) => {
                    let state = states
                        .get_mut(host)
                        .ok_or_else(|| Error::not_found("host", host.clone()))?;
                    if !state.accepts(entry.config.hints.coschedule) {
                        unplaced.push(name.clone());
                        continue;
                    }
                    state.place(&entry.config, true);
                    heap.update(state);
                    host.clone()
                }
                None => {
                    let mut skipped: Vec<String> = Vec::new();
                    let mut chosen = None;
                    while let Some(host) = heap.pop() {
                        let state = states.get_mut(&host).unwrap();
                        if state.ratio(metric).is_infinite()
                            || !state.accepts(entry.config.hints.coschedule)
                        {
                            skipped.push(host);
                            continue;
                        }
                        state.place(&entry.config, false);
                        heap.update(state);
                        chosen = Some(host);
                        break;
                    }
                    for host in skipped {
                        heap.update(states.get(&host).unwrap());
                    }
                    match chosen {
                        Some(host) => host,
                        None => {
                            unplaced.push(name.clone());
                            continue;
                        }
                    }
                }
            };

            placed_host.insert(name.clone(), target.clone());
            push_partition(&mut result, &target, name, &entry.config);
        }
    }

    // Colocating entries follow the host their direct target landed on.
    // Chains may nest, so iterate until no entry makes progress.
    let mut remaining = deferred;
    while !remaining.is_empty() {
        let mut next_round = Vec::new();
        let mut progressed = false;
        for idx in remaining {
            let entry = &queue[idx];
            let target_name = entry.config.hints.colocate.as_deref().unwrap();
            let Some(host) = placed_host.get(target_name).cloned() else {
                next_round.push(idx);
                continue;
            };
            progressed = true;
            for name in &entry.names {
                let state = states.get_mut(&host).unwrap();
                if !state.accepts(entry.config.hints.coschedule) {
                    unplaced.push(name.clone());
                    continue;
                }
                state.place(&entry.config, true);
                heap.update(state);
                placed_host.insert(name.clone(), host.clone());
                push_partition(&mut result, &host, name, &entry.config);
            }
        }
        if !progressed {
            for idx in next_round {
                unplaced.extend(queue[idx].names.iter().cloned());
            }
            break;
        }
        remaining = next_round;
    }

    if !unplaced.is_empty() {
        unplaced.sort();
        return Err(Error::Validation(format!(
            "unsatisfiable constraints for: {}",
            unplaced.join(", ")
        )));
    }
    Ok(result)
}

fn push_partition(
    result: &mut HashMap<String, Vec<QueuedVms>>,
    host: &str,
    name: &str,
    config: &VmConfig,
) {
    let partitions = result.entry(host.to_string()).or_default();
    // Extend the partition sharing this config rather than one-per-name.
    if let Some(last) = partitions.last_mut() {
        if last.config == *config {
            last.names.push(name.to_string());
            return;
        }
    }
    partitions.push(QueuedVms {
        names: vec![name.to_string()],
        config: config.clone(),
    });
}

/// Walk every colocation chain to its root. Returns the effective pin per
/// entry (inherited from a pinned root). Fails on unknown targets, cycles,
/// and chains containing a coschedule of zero.
fn resolve_colocation(
    queue: &[QueuedVms],
    owner: &HashMap<&str, usize>,
) -> Result<Vec<Option<String>>> {
    let mut pins: Vec<Option<String>> = queue
        .iter()
        .map(|e| e.config.hints.schedule.clone())
        .collect();

    for (idx, entry) in queue.iter().enumerate() {
        let Some(target) = entry.config.hints.colocate.as_deref() else {
            continue;
        };

        let mut chain: HashSet<usize> = HashSet::from([idx]);
        let mut zero_in_chain = entry.config.hints.coschedule == 0;
        let mut cursor = target;
        let root = loop {
            let &next = owner
                .get(cursor)
                .ok_or_else(|| Error::not_found("colocate target", cursor))?;
            if !chain.insert(next) {
                return Err(Error::Validation(format!(
                    "colocation cycle through {}",
                    cursor
                )));
            }
            zero_in_chain |= queue[next].config.hints.coschedule == 0;
            match queue[next].config.hints.colocate.as_deref() {
                Some(t) => cursor = t,
                None => break next,
            }
        };

        if zero_in_chain {
            return Err(Error::Validation(format!(
                "colocation chain through {} demands an exclusive host",
                target
            )));
        }
        if pins[idx].is_none() {
            pins[idx] = queue[root].config.hints.schedule.clone();
        }
    }
    Ok(pins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::ScheduleHints;

    fn entry(names: &[&str]) -> QueuedVms {
        QueuedVms {
            names: names.iter().map(|n| n.to_string()).collect(),
            config: VmConfig::default(),
        }
    }

    fn entry_with_hints(names: &[&str], hints: ScheduleHints) -> QueuedVms {
        let mut e = entry(names);
        e.config.hints = hints;
        e
    }

    fn hosts(names: &[&str]) -> Vec<HostStats> {
        names.iter().map(|n| HostStats::new(*n, 8, 16384)).collect()
    }

    fn count_on(result: &HashMap<String, Vec<QueuedVms>>, host: &str) -> usize {
        result
            .get(host)
            .map(|parts| parts.iter().map(|p| p.names.len()).sum())
            .unwrap_or(0)
    }

    #[test]
    fn uniform_load_balances_within_one() {
        let queue = vec![entry(&["a", "b", "c", "d", "e", "f", "g"])];
        let result = schedule(&queue, &hosts(&["h0", "h1", "h2"]), CommitMetric::Cpu).unwrap();
        let counts: Vec<usize> = ["h0", "h1", "h2"]
            .iter()
            .map(|h| count_on(&result, h))
            .collect();
        assert_eq!(counts.iter().sum::<usize>(), 7);
        assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1);
    }

    #[test]
    fn three_plus_one_pinned_lands_as_specified() {
        let queue = vec![
            entry(&["a", "b", "c"]),
            entry_with_hints(
                &["pinned"],
                ScheduleHints {
                    schedule: Some("0".into()),
                    coschedule: -1,
                    colocate: None,
                },
            ),
        ];
        let result = schedule(&queue, &hosts(&["0", "1", "2"]), CommitMetric::Cpu).unwrap();

        assert_eq!(count_on(&result, "0"), 1, "pinned host takes only its pin");
        assert!(count_on(&result, "1") >= 1);
        assert!(count_on(&result, "2") >= 1);
        let total: usize = ["0", "1", "2"].iter().map(|h| count_on(&result, h)).sum();
        assert_eq!(total, 4);

        let on_zero = &result["0"][0];
        assert_eq!(on_zero.names, vec!["pinned"]);
    }

    #[test]
    fn pin_to_unknown_host_fails() {
        let queue = vec![entry_with_hints(
            &["a"],
            ScheduleHints {
                schedule: Some("nope".into()),
                coschedule: -1,
                colocate: None,
            },
        )];
        assert!(schedule(&queue, &hosts(&["h0"]), CommitMetric::Cpu).is_err());
    }

    #[test]
    fn limit_is_respected_or_schedule_fails() {
        let mut one = hosts(&["h0"]);
        one[0].limit = 2;
        let queue = vec![entry(&["a", "b"])];
        let result = schedule(&queue, &one, CommitMetric::Cpu).unwrap();
        assert_eq!(count_on(&result, "h0"), 2);

        let mut one = hosts(&["h0"]);
        one[0].limit = 2;
        let queue = vec![entry(&["a", "b", "c"])];
        let err = schedule(&queue, &one, CommitMetric::Cpu).unwrap_err();
        assert!(err.to_string().contains("c"));
    }

    #[test]
    fn colocate_chain_lands_together() {
        let queue = vec![
            entry(&["root"]),
            entry_with_hints(
                &["follower1", "follower2"],
                ScheduleHints {
                    schedule: None,
                    coschedule: -1,
                    colocate: Some("root".into()),
                },
            ),
        ];
        let result = schedule(&queue, &hosts(&["h0", "h1", "h2"]), CommitMetric::Cpu).unwrap();

        let host_of = |name: &str| {
            result
                .iter()
                .find(|(_, parts)| parts.iter().any(|p| p.names.iter().any(|n| n == name)))
                .map(|(h, _)| h.clone())
                .unwrap()
        };
        assert_eq!(host_of("root"), host_of("follower1"));
        assert_eq!(host_of("root"), host_of("follower2"));
    }

    #[test]
    fn colocate_chain_inherits_root_pin() {
        let queue = vec![
            entry_with_hints(
                &["root"],
                ScheduleHints {
                    schedule: Some("h2".into()),
                    coschedule: -1,
                    colocate: None,
                },
            ),
            entry_with_hints(
                &["follower"],
                ScheduleHints {
                    schedule: None,
                    coschedule: -1,
                    colocate: Some("root".into()),
                },
            ),
        ];
        let result = schedule(&queue, &hosts(&["h0", "h1", "h2"]), CommitMetric::Cpu).unwrap();
        assert_eq!(count_on(&result, "h2"), 2);
    }

    #[test]
    fn colocate_with_exclusive_member_fails() {
        let queue = vec![
            entry_with_hints(
                &["root"],
                ScheduleHints {
                    schedule: None,
                    coschedule: 0,
                    colocate: None,
                },
            ),
            entry_with_hints(
                &["follower"],
                ScheduleHints {
                    schedule: None,
                    coschedule: -1,
                    colocate: Some("root".into()),
                },
            ),
        ];
        let err = schedule(&queue, &hosts(&["h0", "h1"]), CommitMetric::Cpu).unwrap_err();
        assert!(err.to_string().contains("exclusive"));
    }

    #[test]
    fn unknown_colocate_target_is_hard_error() {
        let queue = vec![entry_with_hints(
            &["a"],
            ScheduleHints {
                schedule: None,
                coschedule: -1,
                colocate: Some("ghost".into()),
            },
        )];
        let err = schedule(&queue, &hosts(&["h0"]), CommitMetric::Cpu).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn coschedule_zero_takes_a_host_alone() {
        let queue = vec![
            entry_with_hints(
                &["loner"],
                ScheduleHints {
                    schedule: None,
                    coschedule: 0,
                    colocate: None,
                },
            ),
            entry(&["a", "b"]),
        ];
        let result = schedule(&queue, &hosts(&["h0", "h1"]), CommitMetric::Cpu).unwrap();

        let loner_host = result
            .iter()
            .find(|(_, parts)| parts.iter().any(|p| p.names.contains(&"loner".to_string())))
            .map(|(h, _)| h.clone())
            .unwrap();
        assert_eq!(count_on(&result, &loner_host), 1);
    }

    #[test]
    fn schedule_is_deterministic() {
        let queue = vec![entry(&["a", "b", "c", "d", "e"])];
        let cluster = hosts(&["h0", "h1", "h2"]);
        let first = schedule(&queue, &cluster, CommitMetric::Cpu).unwrap();
        for _ in 0..10 {
            let again = schedule(&queue, &cluster, CommitMetric::Cpu).unwrap();
            for (host, parts) in &first {
                let names: Vec<_> = parts.iter().flat_map(|p| p.names.clone()).collect();
                let again_names: Vec<_> = again[host].iter().flat_map(|p| p.names.clone()).collect();
                assert_eq!(names, again_names);
            }
        }
    }

    #[test]
    fn memory_metric_prefers_the_bigger_host() {
        let mut cluster = hosts(&["small", "big"]);
        cluster[0].mem_total = 4096;
        cluster[1].mem_total = 65536;
        let queue = vec![entry(&["a", "b", "c", "d"])];
        let result = schedule(&queue, &cluster, CommitMetric::Memory).unwrap();
        assert!(count_on(&result, "big") > count_on(&result, "small"));
    }
}
