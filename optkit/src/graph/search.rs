//! Linear pattern search over a [`ConnectedGraph`].
use itertools::Itertools;
use tracing::trace;

use super::{ConnectedGraph, OpKind, Operation};

/// A sequence of operation kinds to look for, the i-th op of a match having the i-th kind
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatternType {
    pub pattern: Vec<OpKind>,
}

impl PatternType {
    pub fn new(pattern: Vec<OpKind>) -> Self {
        Self { pattern }
    }

    /// Every sequence picking one kind per step, e.g. `[[Conv, Linear], [BatchNorm]]`
    /// expands to `[Conv, BatchNorm]` and `[Linear, BatchNorm]`
    pub fn expand(steps: &[&[OpKind]]) -> Vec<Self> {
        steps
            .iter()
            .map(|step| step.iter().copied())
            .multi_cartesian_product()
            .map(Self::new)
            .collect()
    }
}

/// Called once per match found by [`GraphSearcher`]
pub trait PatternHandler {
    fn handle(&mut self, pattern: &PatternType, ops: &[&Operation]);
}

impl<F: FnMut(&PatternType, &[&Operation])> PatternHandler for F {
    fn handle(&mut self, pattern: &PatternType, ops: &[&Operation]) {
        self(pattern, ops)
    }
}

pub struct GraphSearcher<'a> {
    graph: &'a ConnectedGraph,
    patterns: Vec<PatternType>,
}

impl<'a> GraphSearcher<'a> {
    pub fn new(graph: &'a ConnectedGraph, patterns: Vec<PatternType>) -> Self {
        let patterns = patterns.into_iter().unique().collect();
        Self { graph, patterns }
    }

    /// Walks `pattern` from `start`, following the output of each op only when it has a
    /// single consumer
    fn match_from(
        &self,
        start: &'a Operation,
        pattern: &PatternType,
    ) -> Option<Vec<&'a Operation>> {
        let (first, rest) = pattern.pattern.split_first()?;
        if start.kind() != *first {
            return None;
        }
        let mut matched = vec![start];
        let mut current = start;
        for kind in rest {
            if current.feeds_model_output() {
                return None;
            }
            let [next] = self.graph.consumers(current) else {
                return None;
            };
            let next = self.graph.op(*next);
            if next.kind() != *kind {
                return None;
            }
            matched.push(next);
            current = next;
        }
        Some(matched)
    }

    /// All maximal matches, ordered by start op then by pattern order. A match is dropped
    /// when a longer match starting at the same op extends it.
    pub fn find_all_patterns(&self) -> Vec<(&PatternType, Vec<&'a Operation>)> {
        let mut found = Vec::new();
        for op in self.graph.ordered_ops() {
            let at_op: Vec<_> = self
                .patterns
                .iter()
                .filter_map(|p| self.match_from(op, p).map(|ops| (p, ops)))
                .collect();
            let maximal = at_op.iter().filter(|(pattern, _)| {
                !at_op.iter().any(|(other, _)| {
                    other.pattern.len() > pattern.pattern.len()
                        && other.pattern.starts_with(&pattern.pattern)
                })
            });
            found.extend(maximal.cloned());
        }
        trace!("found {} pattern matches", found.len());
        found
    }

    pub fn find_all_patterns_in_graph_apply_actions<H: PatternHandler>(&self, handler: &mut H) {
        for (pattern, ops) in self.find_all_patterns() {
            handler.handle(pattern, &ops);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{Activation, Layer},
        model::Model,
        testing::{random_bn, random_conv},
    };

    #[test]
    fn test_expand_patterns() {
        let patterns = PatternType::expand(&[
            &[OpKind::Conv, OpKind::Linear],
            &[OpKind::BatchNorm],
            &[OpKind::Relu, OpKind::Relu6],
        ]);
        assert_eq!(patterns.len(), 4);
        assert_eq!(
            patterns[0].pattern,
            vec![OpKind::Conv, OpKind::BatchNorm, OpKind::Relu]
        );
    }

    #[test]
    fn test_only_maximal_matches_are_reported() {
        let model = Model::sequential(
            "net",
            [
                ("conv1", Layer::Convolution(random_conv(4, 3, 3, 0))),
                ("bn1", Layer::BatchNorm(random_bn(4, 1))),
                ("relu1", Layer::Activation(Activation::Relu)),
                ("conv2", Layer::Convolution(random_conv(4, 4, 1, 2))),
                ("bn2", Layer::BatchNorm(random_bn(4, 3))),
            ],
        )
        .unwrap();
        let graph = ConnectedGraph::build(&model, &[vec![1, 3, 6, 6]]).unwrap();
        let mut patterns = PatternType::expand(&[&[OpKind::Conv], &[OpKind::BatchNorm]]);
        patterns.extend(PatternType::expand(&[
            &[OpKind::Conv],
            &[OpKind::BatchNorm],
            &[OpKind::Relu],
        ]));
        let searcher = GraphSearcher::new(&graph, patterns);

        let mut seen = Vec::new();
        let mut record = |_: &PatternType, ops: &[&Operation]| {
            seen.push(ops.iter().map(|op| op.name().to_string()).collect::<Vec<_>>());
        };
        searcher.find_all_patterns_in_graph_apply_actions(&mut record);
        assert_eq!(
            seen,
            vec![
                vec!["convolution_0", "batch_norm_1", "relu_2"],
                vec!["convolution_3", "batch_norm_4"],
            ]
        );
    }

    #[test]
    fn test_fan_out_breaks_matches() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv = model
            .add_module("conv", Layer::Convolution(random_conv(2, 2, 1, 0)))
            .unwrap();
        let bn = model.add_module("bn", Layer::BatchNorm(random_bn(2, 1))).unwrap();
        let relu = model
            .add_module("relu", Layer::Activation(Activation::Relu))
            .unwrap();
        let c = model.call(conv, vec![x]).unwrap();
        let b = model.call(bn, vec![c.clone()]).unwrap();
        let r = model.call(relu, vec![c]).unwrap();
        model.set_outputs(vec![b, r]);

        let graph = ConnectedGraph::build(&model, &[vec![1, 2, 2, 2]]).unwrap();
        let searcher = GraphSearcher::new(
            &graph,
            PatternType::expand(&[&[OpKind::Conv], &[OpKind::BatchNorm]]),
        );
        assert!(searcher.find_all_patterns().is_empty());
    }

    #[test]
    fn test_matches_stop_at_model_outputs() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv = model
            .add_module("conv", Layer::Convolution(random_conv(2, 2, 1, 0)))
            .unwrap();
        let bn = model.add_module("bn", Layer::BatchNorm(random_bn(2, 1))).unwrap();
        let c = model.call(conv, vec![x]).unwrap();
        let b = model.call(bn, vec![c.clone()]).unwrap();
        model.set_outputs(vec![c, b]);

        let graph = ConnectedGraph::build(&model, &[vec![1, 2, 2, 2]]).unwrap();
        let searcher = GraphSearcher::new(
            &graph,
            PatternType::expand(&[&[OpKind::Conv], &[OpKind::BatchNorm]]),
        );
        assert!(searcher.find_all_patterns().is_empty());
    }
}
