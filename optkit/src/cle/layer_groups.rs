//! Discovery of the chains of layers cross-layer scaling can rebalance.
use std::collections::HashSet;

use tracing::debug;

use crate::graph::{ConnectedGraph, OpId, OpKind};

/// Kinds collected into a layer group
const GROUP_MEMBERS: [OpKind; 3] = [OpKind::Conv, OpKind::DepthwiseConv, OpKind::Linear];

/// Kinds a layer group extends through, anything else closes the current group
const PASS_THROUGH: [OpKind; 7] = [
    OpKind::Conv,
    OpKind::DepthwiseConv,
    OpKind::Linear,
    OpKind::Relu,
    OpKind::PRelu,
    OpKind::Pad,
    OpKind::Identity,
];

fn record(groups: &mut Vec<Vec<OpId>>, group: Vec<OpId>) {
    if group.len() > 1 && !groups.contains(&group) {
        groups.push(group);
    }
}

/// Depth-first walk from every starting op collecting maximal chains of conv/linear layers
/// separated only by pass-through ops. A group ends at an op whose result is also a model
/// output. An op is expanded once, even when reachable through
/// several paths, so a group continuing past a reconverging branch is only reported along
/// the first path that reaches it.
pub fn find_layer_groups_to_scale(graph: &ConnectedGraph) -> Vec<Vec<OpId>> {
    let mut visited: HashSet<OpId> = HashSet::new();
    let mut groups = Vec::new();
    for start in graph.starting_ops() {
        let mut stack: Vec<(OpId, Vec<OpId>)> = vec![(start.id(), Vec::new())];
        while let Some((op_id, mut group)) = stack.pop() {
            if !visited.insert(op_id) {
                record(&mut groups, group);
                continue;
            }
            let op = graph.op(op_id);
            if GROUP_MEMBERS.contains(&op.kind()) {
                group.push(op_id);
            }
            // a result read outside the chain must keep its scale
            if !PASS_THROUGH.contains(&op.kind()) || op.feeds_model_output() {
                record(&mut groups, std::mem::take(&mut group));
            }
            match graph.consumers(op) {
                [] => record(&mut groups, group),
                [next] => stack.push((*next, group)),
                consumers => {
                    record(&mut groups, group);
                    stack.extend(consumers.iter().rev().map(|c| (*c, Vec::new())));
                }
            }
        }
    }
    debug!("found {} layer group(s) to scale", groups.len());
    groups
}

/// Layers scaled jointly: a pair, or a layer, a depthwise layer and the layer after it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClsSet {
    Pair(OpId, OpId),
    Triplet(OpId, OpId, OpId),
}

impl ClsSet {
    pub fn ops(&self) -> Vec<OpId> {
        match self {
            ClsSet::Pair(a, b) => vec![*a, *b],
            ClsSet::Triplet(a, b, c) => vec![*a, *b, *c],
        }
    }

    /// Splits a layer group into cls sets. A depthwise layer is only scaled together with
    /// the layer following it, a trailing depthwise layer ends the group.
    pub fn from_layer_group(graph: &ConnectedGraph, group: &[OpId]) -> Vec<ClsSet> {
        let mut sets = Vec::new();
        let Some((&first, mut rest)) = group.split_first() else {
            return sets;
        };
        let mut prev = first;
        while let Some((&next, tail)) = rest.split_first() {
            rest = tail;
            if graph.op(next).kind() == OpKind::DepthwiseConv {
                let Some((&after, tail)) = rest.split_first() else {
                    break;
                };
                rest = tail;
                sets.push(ClsSet::Triplet(prev, next, after));
                prev = after;
            } else {
                sets.push(ClsSet::Pair(prev, next));
                prev = next;
            }
        }
        sets
    }
}

/// For every set, whether a ReLU directly consumes each layer but the last
pub fn is_relu_activation_present_in_cls_sets(
    graph: &ConnectedGraph,
    cls_sets: &[ClsSet],
) -> Vec<Vec<bool>> {
    cls_sets
        .iter()
        .map(|set| {
            let ops = set.ops();
            ops[..ops.len() - 1]
                .iter()
                .map(|op| {
                    graph
                        .consumers(graph.op(*op))
                        .first()
                        .is_some_and(|c| graph.op(*c).kind() == OpKind::Relu)
                })
                .collect()
        })
        .collect()
}
