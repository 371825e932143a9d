//! Placement scoring over cluster nodes.

use super::types::ServiceConfiguration;
use crate::cluster::NodeResourceSnapshot;

/// Picks the node a service should be placed on.
///
/// With a pinned `node` the pin is the only candidate. Otherwise the
/// candidate with the lowest weighted load wins; ties break to the head
/// node first, then to the smallest unique id.
pub fn choose_node<'a>(
    candidates: &'a [NodeResourceSnapshot],
    configuration: &ServiceConfiguration,
    head_name: &str,
) -> Option<&'a NodeResourceSnapshot> {
    if let Some(pinned) = &configuration.node {
        return candidates
            .iter()
            .find(|c| c.node_name == *pinned)
            .filter(|c| fits(c, configuration));
    }

    candidates
        .iter()
        .filter(|c| fits(c, configuration))
        .min_by(|a, b| {
            a.load_factor()
                .partial_cmp(&b.load_factor())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_head = a.node_name == head_name;
                    let b_head = b.node_name == head_name;
                    b_head.cmp(&a_head)
                })
                .then_with(|| a.node_unique_id.cmp(&b.node_unique_id))
        })
}

fn fits(candidate: &NodeResourceSnapshot, configuration: &ServiceConfiguration) -> bool {
    if candidate.drain {
        return false;
    }
    candidate.max_memory_mib == 0
        || candidate.used_memory_mib + configuration.process.max_heap_mib
            <= candidate.max_memory_mib
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(name: &str, id_byte: u8, used: u64, services: u32) -> NodeResourceSnapshot {
        NodeResourceSnapshot {
            node_name: name.to_string(),
            node_unique_id: Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, id_byte]),
            max_memory_mib: 4096,
            used_memory_mib: used,
            service_count: services,
            cpu_load: 0.0,
            drain: false,
            timestamp_ms: 0,
        }
    }

    fn config(heap: u64) -> ServiceConfiguration {
        let mut config = ServiceConfiguration::for_task("lobby");
        config.process.max_heap_mib = heap;
        config
    }

    #[test]
    fn test_lowest_load_wins() {
        let candidates = vec![
            candidate("node-a", 1, 2048, 4),
            candidate("node-b", 2, 512, 1),
        ];
        let chosen = choose_node(&candidates, &config(512), "node-a").unwrap();
        assert_eq!(chosen.node_name, "node-b");
    }

    #[test]
    fn test_tie_breaks_to_head_then_smallest_id() {
        let candidates = vec![
            candidate("node-c", 3, 1024, 2),
            candidate("node-b", 2, 1024, 2),
            candidate("node-a", 1, 1024, 2),
        ];

        let chosen = choose_node(&candidates, &config(512), "node-b").unwrap();
        assert_eq!(chosen.node_name, "node-b");

        let chosen = choose_node(&candidates, &config(512), "elsewhere").unwrap();
        assert_eq!(chosen.node_name, "node-a");
    }

    #[test]
    fn test_pinned_node_is_only_candidate() {
        let candidates = vec![
            candidate("node-a", 1, 0, 0),
            candidate("node-b", 2, 4000, 9),
        ];
        let mut pinned = config(512);
        pinned.node = Some("node-b".to_string());

        // node-b has no memory left for 512 MiB: placement fails instead
        // of falling back to node-a.
        assert!(choose_node(&candidates, &pinned, "node-a").is_none());

        pinned.process.max_heap_mib = 64;
        let chosen = choose_node(&candidates, &pinned, "node-a").unwrap();
        assert_eq!(chosen.node_name, "node-b");
    }

    #[test]
    fn test_memory_exhausted_nodes_are_skipped() {
        let candidates = vec![candidate("node-a", 1, 4000, 1)];
        assert!(choose_node(&candidates, &config(512), "node-a").is_none());
    }
}
