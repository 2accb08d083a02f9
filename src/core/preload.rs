//! Pre-load table and bin-packing planner.
//!
//! The table is the authoritative record of which models sit resident in
//! which sharable idle container. The planner places one model at a time:
//! first fit into the roomiest container that does not already hold it, and
//! when nothing fits, residents with a lower expected saved latency are
//! evicted to make room.

use crate::core::model_table::ModelData;
use crate::core::ProxyId;
use std::collections::{HashMap, HashSet};

/// Model memory budget per container (MB)
pub const MODEL_MEMORY_BUDGET_MB: u64 = 2047;

/// Outcome of one bin-packing placement
#[derive(Debug, Default)]
pub struct BinPackOutcome {
    /// Chosen host, if any
    pub target: Option<ProxyId>,
    /// Models evicted to make room, with the container they were evicted from.
    /// The caller owes each one an off-load signal.
    pub evicted: Vec<(ProxyId, ModelData)>,
}

/// Mapping `container → resident models` for sharable idle containers
#[derive(Debug, Default)]
pub struct PreloadTable {
    entries: HashMap<ProxyId, Vec<ModelData>>,
}

impl PreloadTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container with an empty model list
    pub fn init_container(&mut self, id: ProxyId) {
        self.entries.entry(id).or_default();
    }

    /// Drop a container, returning the models that were resident on it
    pub fn remove_container(&mut self, id: ProxyId) -> Vec<ModelData> {
        self.entries.remove(&id).unwrap_or_default()
    }

    /// Whether the container is known to the table
    pub fn contains_container(&self, id: ProxyId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Models resident on a container
    pub fn models_on(&self, id: ProxyId) -> &[ModelData] {
        self.entries.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total resident model size on a container (MB)
    pub fn total_size(&self, id: ProxyId) -> u64 {
        self.models_on(id).iter().map(|m| m.model_size_mb).sum()
    }

    /// Remaining model capacity on a container (MB)
    pub fn remaining_capacity(&self, id: ProxyId) -> u64 {
        MODEL_MEMORY_BUDGET_MB.saturating_sub(self.total_size(id))
    }

    /// Whether any container holds a model with this name
    pub fn model_assigned(&self, model_name: &str) -> bool {
        self.entries
            .values()
            .any(|models| models.iter().any(|m| m.model_name == model_name))
    }

    /// Containers currently holding a model with this name
    pub fn hosts_of_model(&self, model_name: &str) -> Vec<ProxyId> {
        self.entries
            .iter()
            .filter(|(_, models)| models.iter().any(|m| m.model_name == model_name))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Append a model to a container's list. Refused when the name is already
    /// present or the container's model budget would be exceeded.
    pub fn append(&mut self, id: ProxyId, model: ModelData) -> bool {
        let fits = self.remaining_capacity(id) >= model.model_size_mb;
        let Some(models) = self.entries.get_mut(&id) else {
            return false;
        };
        if !fits || models.iter().any(|m| m.model_name == model.model_name) {
            return false;
        }
        models.push(model);
        true
    }

    /// Remove one model from a container's list, returning it when present
    pub fn remove_model(&mut self, id: ProxyId, model_name: &str) -> Option<ModelData> {
        let models = self.entries.get_mut(&id)?;
        let pos = models.iter().position(|m| m.model_name == model_name)?;
        Some(models.remove(pos))
    }

    /// Distinct action names across all entries (for fleet publication)
    pub fn distinct_action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .flatten()
            .map(|m| m.action_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Place `candidate` on one of the `shared` containers.
    ///
    /// First fit among containers that do not already hold the model name,
    /// preferring the largest remaining capacity. When nothing fits, resident
    /// models are scanned in ascending `expected_saved_latency` order; while
    /// the head is strictly worse than the candidate it is evicted and its
    /// host re-checked. The table is updated for evictions only; appending
    /// the candidate on success is the caller's move.
    pub fn bin_packing(&mut self, shared: &HashSet<ProxyId>, candidate: &ModelData) -> BinPackOutcome {
        let mut outcome = BinPackOutcome::default();

        let mut candidates: Vec<ProxyId> = self
            .entries
            .keys()
            .copied()
            .filter(|id| shared.contains(id))
            .filter(|id| {
                !self.models_on(*id)
                    .iter()
                    .any(|m| m.model_name == candidate.model_name)
            })
            .collect();
        candidates.sort_by(|a, b| self.remaining_capacity(*b).cmp(&self.remaining_capacity(*a)));

        if let Some(id) = candidates
            .iter()
            .find(|id| self.remaining_capacity(**id) >= candidate.model_size_mb)
        {
            outcome.target = Some(*id);
            return outcome;
        }

        // No fit: evict cheaper residents, worst savings first
        loop {
            let head = self
                .entries
                .iter()
                .filter(|(id, _)| shared.contains(*id))
                .flat_map(|(id, models)| models.iter().map(move |m| (*id, m.clone())))
                .min_by(|(_, a), (_, b)| {
                    a.expected_saved_latency
                        .partial_cmp(&b.expected_saved_latency)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

            let Some((host, model)) = head else {
                break;
            };
            if model.expected_saved_latency >= candidate.expected_saved_latency {
                break;
            }

            if let Some(models) = self.entries.get_mut(&host) {
                models.retain(|m| m.model_name != model.model_name);
            }
            outcome.evicted.push((host, model));

            let holds_name = self
                .models_on(host)
                .iter()
                .any(|m| m.model_name == candidate.model_name);
            if !holds_name && self.remaining_capacity(host) >= candidate.model_size_mb {
                outcome.target = Some(host);
                return outcome;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, size: u64, saved: f64) -> ModelData {
        ModelData {
            action_name: format!("guest/{}", name.to_lowercase()),
            model_name: name.to_string(),
            model_loading_latency_ms: 1000,
            lambda: 0.1,
            arrival_probability: 0.1,
            model_size_mb: size,
            expected_saved_latency: saved,
        }
    }

    fn shared(ids: &[ProxyId]) -> HashSet<ProxyId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_append_enforces_budget_and_distinct_names() {
        let mut table = PreloadTable::new();
        let c = ProxyId(1);
        table.init_container(c);

        assert!(table.append(c, model("A", 2000, 10.0)));
        // duplicate name refused
        assert!(!table.append(c, model("A", 10, 10.0)));
        // would exceed 2047 MB
        assert!(!table.append(c, model("B", 100, 10.0)));
        // still fits
        assert!(table.append(c, model("C", 47, 10.0)));
        assert_eq!(table.total_size(c), 2047);
        // unknown container refused
        assert!(!table.append(ProxyId(9), model("D", 1, 1.0)));
    }

    #[test]
    fn test_first_fit_prefers_roomiest_container() {
        let mut table = PreloadTable::new();
        let (a, b) = (ProxyId(1), ProxyId(2));
        table.init_container(a);
        table.init_container(b);
        table.append(a, model("A", 1500, 10.0));
        table.append(b, model("B", 100, 10.0));

        let outcome = table.bin_packing(&shared(&[a, b]), &model("C", 400, 50.0));
        assert_eq!(outcome.target, Some(b));
        assert!(outcome.evicted.is_empty());
    }

    #[test]
    fn test_containers_holding_the_model_are_skipped() {
        let mut table = PreloadTable::new();
        let (a, b) = (ProxyId(1), ProxyId(2));
        table.init_container(a);
        table.init_container(b);
        // a is roomier but already holds C
        table.append(a, model("C", 10, 10.0));
        table.append(b, model("B", 500, 10.0));

        let outcome = table.bin_packing(&shared(&[a, b]), &model("C", 400, 50.0));
        assert_eq!(outcome.target, Some(b));
    }

    #[test]
    fn test_eviction_frees_lowest_saved_latency_first() {
        let mut table = PreloadTable::new();
        let c = ProxyId(1);
        table.init_container(c);
        // 1990 MB resident, all with expected saved latency 50
        table.append(c, model("A", 700, 50.0));
        table.append(c, model("B", 700, 50.0));
        table.append(c, model("D", 590, 50.0));

        // 600 MB candidate with saved latency 200 → evict one resident
        let outcome = table.bin_packing(&shared(&[c]), &model("E", 600, 200.0));
        assert_eq!(outcome.target, Some(c));
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].0, c);
        assert!(table.remaining_capacity(c) >= 600);
    }

    #[test]
    fn test_no_eviction_of_equal_or_better_models() {
        let mut table = PreloadTable::new();
        let c = ProxyId(1);
        table.init_container(c);
        table.append(c, model("A", 2000, 200.0));

        // candidate saves no more than the resident: nothing to evict
        let outcome = table.bin_packing(&shared(&[c]), &model("B", 600, 200.0));
        assert!(outcome.target.is_none());
        assert!(outcome.evicted.is_empty());
        assert_eq!(table.models_on(c).len(), 1);
    }

    #[test]
    fn test_eviction_cascades_until_fit() {
        let mut table = PreloadTable::new();
        let c = ProxyId(1);
        table.init_container(c);
        table.append(c, model("A", 1000, 10.0));
        table.append(c, model("B", 1000, 20.0));

        let outcome = table.bin_packing(&shared(&[c]), &model("E", 1500, 100.0));
        assert_eq!(outcome.target, Some(c));
        assert_eq!(outcome.evicted.len(), 2);
        // worst savings evicted first
        assert_eq!(outcome.evicted[0].1.model_name, "A");
        assert_eq!(outcome.evicted[1].1.model_name, "B");
    }

    #[test]
    fn test_only_shared_containers_are_considered() {
        let mut table = PreloadTable::new();
        let (a, b) = (ProxyId(1), ProxyId(2));
        table.init_container(a);
        table.init_container(b);

        // only b is shared
        let outcome = table.bin_packing(&shared(&[b]), &model("C", 100, 50.0));
        assert_eq!(outcome.target, Some(b));
    }

    #[test]
    fn test_empty_shared_pool_returns_none() {
        let mut table = PreloadTable::new();
        let outcome = table.bin_packing(&HashSet::new(), &model("C", 100, 50.0));
        assert!(outcome.target.is_none());
    }

    #[test]
    fn test_distinct_action_names_sorted() {
        let mut table = PreloadTable::new();
        let (a, b) = (ProxyId(1), ProxyId(2));
        table.init_container(a);
        table.init_container(b);
        table.append(a, model("Z", 10, 1.0));
        table.append(b, model("A", 10, 1.0));
        table.append(b, model("Z", 10, 1.0));

        assert_eq!(table.distinct_action_names(), vec!["guest/a", "guest/z"]);
    }

    #[test]
    fn test_remove_container_returns_models() {
        let mut table = PreloadTable::new();
        let c = ProxyId(1);
        table.init_container(c);
        table.append(c, model("A", 10, 1.0));
        table.append(c, model("B", 10, 1.0));

        let models = table.remove_container(c);
        assert_eq!(models.len(), 2);
        assert!(!table.contains_container(c));
        assert!(table.remove_container(c).is_empty());
    }

    #[test]
    fn test_hosts_of_model() {
        let mut table = PreloadTable::new();
        let (a, b) = (ProxyId(1), ProxyId(2));
        table.init_container(a);
        table.init_container(b);
        table.append(a, model("A", 10, 1.0));
        table.append(b, model("A", 10, 1.0));
        table.append(b, model("B", 10, 1.0));

        let mut hosts = table.hosts_of_model("A");
        hosts.sort();
        assert_eq!(hosts, vec![a, b]);
        assert_eq!(table.hosts_of_model("B"), vec![b]);
        assert!(table.hosts_of_model("C").is_empty());
        assert!(table.model_assigned("B"));
        assert!(!table.model_assigned("C"));
    }
}
