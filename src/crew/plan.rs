//! Execution waves for a crew's members.
//!
//! Members and their `depends_on` edges form a directed graph. A topological
//! sort rejects cycles; each member's depth (longest dependency chain) then
//! decides its wave, so every member of a wave can run concurrently.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::MemberPolicy;
use crate::error::FailureCause;

/// Group member indices into waves. `members` is the crew's declaration order.
pub fn build_waves(
    crew: &str,
    members: &[&str],
    policy: &MemberPolicy,
) -> Result<Vec<Vec<usize>>, FailureCause> {
    if members.is_empty() {
        return Ok(Vec::new());
    }

    let index: HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    if let Some(unknown) = policy.member_ids().find(|id| !index.contains_key(id)) {
        return Err(FailureCause::Misconfigured {
            scope: crew.to_string(),
            reason: format!("policy names unknown member '{unknown}'"),
        });
    }

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..members.len()).map(|i| graph.add_node(i)).collect();

    for (to, id) in members.iter().enumerate() {
        for dep in policy.rule(id).depends_on {
            let from = index.get(dep.as_str()).ok_or_else(|| FailureCause::Misconfigured {
                scope: crew.to_string(),
                reason: format!("member '{id}' depends on unknown member '{dep}'"),
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| FailureCause::DependencyCycle {
        crew: crew.to_string(),
        member: members[graph[cycle.node_id()]].to_string(),
    })?;

    let mut depth = vec![0usize; members.len()];
    for node in sorted {
        let i = graph[node];
        depth[i] = policy
            .rule(members[i])
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep.as_str()))
            .map(|&d| depth[d] + 1)
            .max()
            .unwrap_or(0);
    }

    let max_depth = depth.iter().copied().max().unwrap_or(0);
    let mut waves = vec![Vec::new(); max_depth + 1];
    for (i, d) in depth.iter().enumerate() {
        waves[*d].push(i);
    }
    Ok(waves)
}
