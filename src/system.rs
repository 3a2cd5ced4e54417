//! Weighted function graphs.

use crate::Func;

/// One function in a [`System`] together with how often it is chosen.
pub struct Node {
    pub func: Box<dyn Func>,
    /// Proportion of iterations which map to this node. Must be finite and
    /// non-negative.
    pub weight: f64,
    /// Probability that a point produced by this node is plotted. Must be in
    /// `[0, 1]`.
    pub opacity: f64,
    /// Weights from this node to each other node (the "xaos" row). Missing
    /// values are treated as `1`; values beyond the node count are ignored.
    pub graph: Vec<f64>,
    pub label: String,
}
impl Node {
    /// A fully opaque node with weight 1 and no transition row.
    pub fn new(func: impl Func + 'static) -> Self {
        Self::from_box(Box::new(func))
    }
    /// Like [`Self::new`], for functions which are already boxed, such as
    /// those from a [`Registry`](crate::variations::Registry).
    #[must_use]
    pub fn from_box(func: Box<dyn Func>) -> Self {
        Self {
            func,
            weight: 1.,
            opacity: 1.,
            graph: Vec::new(),
            label: String::new(),
        }
    }
    #[must_use]
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
    #[must_use]
    pub fn opacity(mut self, opacity: f64) -> Self {
        self.opacity = opacity;
        self
    }
    #[must_use]
    pub fn graph(mut self, graph: Vec<f64>) -> Self {
        self.graph = graph;
        self
    }
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Transition weight to node `to`.
    #[must_use]
    pub fn edge(&self, to: usize) -> f64 {
        self.graph.get(to).copied().unwrap_or(1.)
    }
}
impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.label)
            .field("weight", &self.weight)
            .field("opacity", &self.opacity)
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

/// A generalized iterated function system.
#[derive(Default)]
pub struct System {
    pub nodes: Vec<Node>,
    /// Applied to each point before plotting. It does not feed back into the
    /// iteration.
    pub final_func: Option<Box<dyn Func>>,
}
impl System {
    #[must_use]
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            final_func: None,
        }
    }
    #[must_use]
    pub fn with_final(mut self, f: impl Func + 'static) -> Self {
        self.final_func = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Product of node `to`'s weight and the transition weight from `from`.
    #[must_use]
    pub fn effective_weight(&self, from: usize, to: usize) -> f64 {
        self.nodes[from].edge(to) * self.nodes[to].weight
    }

    /// Verify the system can be iterated.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: no nodes, an opacity outside `[0, 1]`,
    /// a negative or non-finite weight or transition weight, or a node from
    /// which no other node can be chosen.
    pub fn check(&self) -> Result<(), SystemError> {
        if self.is_empty() {
            return Err(SystemError::Empty);
        }
        for (node, n) in self.nodes.iter().enumerate() {
            let opacity = n.opacity;
            if !opacity.is_finite() {
                return Err(SystemError::NonFiniteOpacity { node, opacity });
            }
            if !(0.0..=1.0).contains(&opacity) {
                return Err(SystemError::OpacityOutOfRange { node, opacity });
            }
            let weight = n.weight;
            if !weight.is_finite() {
                return Err(SystemError::NonFiniteWeight { node, weight });
            }
            if weight < 0. {
                return Err(SystemError::NegativeWeight { node, weight });
            }
            for (to, &weight) in n.graph.iter().enumerate() {
                if !weight.is_finite() {
                    return Err(SystemError::NonFiniteEdge {
                        from: node,
                        to,
                        weight,
                    });
                }
                if weight < 0. {
                    return Err(SystemError::NegativeEdge {
                        from: node,
                        to,
                        weight,
                    });
                }
            }
        }
        // A single node is always chosen, whatever its weight.
        if self.nodes.len() > 1 {
            for from in 0..self.nodes.len() {
                let total: f64 = (0..self.nodes.len())
                    .map(|to| self.effective_weight(from, to))
                    .sum();
                if total <= 0. || !total.is_finite() {
                    return Err(SystemError::DeadEnd { node: from });
                }
            }
        }
        Ok(())
    }

    /// Call [`Func::prep`] on every function, including the final.
    pub fn prep(&mut self) {
        for n in &mut self.nodes {
            n.func.prep();
        }
        if let Some(f) = &mut self.final_func {
            f.prep();
        }
    }
}
impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("nodes", &self.nodes)
            .field("final", &self.final_func.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SystemError {
    #[error("cannot render an empty system")]
    Empty,
    #[error("non-finite opacity {opacity} for node {node}")]
    NonFiniteOpacity { node: usize, opacity: f64 },
    #[error("out of bounds opacity {opacity} for node {node}")]
    OpacityOutOfRange { node: usize, opacity: f64 },
    #[error("non-finite weight {weight} for node {node}")]
    NonFiniteWeight { node: usize, weight: f64 },
    #[error("negative weight {weight} for node {node}")]
    NegativeWeight { node: usize, weight: f64 },
    #[error("non-finite weight {weight} for node {from} to {to}")]
    NonFiniteEdge { from: usize, to: usize, weight: f64 },
    #[error("negative weight {weight} for node {from} to {to}")]
    NegativeEdge { from: usize, to: usize, weight: f64 },
    #[error("no node can follow node {node}: all outgoing weights are zero")]
    DeadEnd { node: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChaosRng, Point};

    struct Id;
    impl Func for Id {
        fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
            p
        }
    }

    struct Prepped(bool);
    impl Func for Prepped {
        fn calc(&self, p: Point, _: &mut ChaosRng) -> Point {
            assert!(self.0, "calc before prep");
            p
        }
        fn prep(&mut self) {
            self.0 = true;
        }
    }

    #[test]
    fn check_accepts_good_systems() {
        let one = System::new(vec![Node::new(Id)]);
        assert_eq!(one.check(), Ok(()));
        // a lone node is fine even with zero weight
        let zero = System::new(vec![Node::new(Id).weight(0.)]);
        assert_eq!(zero.check(), Ok(()));
        let xaos = System::new(vec![
            Node::new(Id).graph(vec![0., 1.]),
            Node::new(Id).weight(0.5).opacity(0.).graph(vec![1.]),
        ]);
        assert_eq!(xaos.check(), Ok(()));
    }

    #[test]
    fn check_rejects_bad_systems() {
        let cases: Vec<(System, SystemError)> = vec![
            (System::default(), SystemError::Empty),
            (
                System::new(vec![Node::new(Id).opacity(f64::NAN)]),
                SystemError::NonFiniteOpacity {
                    node: 0,
                    opacity: f64::NAN,
                },
            ),
            (
                System::new(vec![Node::new(Id), Node::new(Id).opacity(1.5)]),
                SystemError::OpacityOutOfRange {
                    node: 1,
                    opacity: 1.5,
                },
            ),
            (
                System::new(vec![Node::new(Id).opacity(-0.1)]),
                SystemError::OpacityOutOfRange {
                    node: 0,
                    opacity: -0.1,
                },
            ),
            (
                System::new(vec![Node::new(Id).weight(f64::INFINITY)]),
                SystemError::NonFiniteWeight {
                    node: 0,
                    weight: f64::INFINITY,
                },
            ),
            (
                System::new(vec![Node::new(Id).weight(-1.)]),
                SystemError::NegativeWeight {
                    node: 0,
                    weight: -1.,
                },
            ),
            (
                System::new(vec![Node::new(Id).graph(vec![f64::NEG_INFINITY])]),
                SystemError::NonFiniteEdge {
                    from: 0,
                    to: 0,
                    weight: f64::NEG_INFINITY,
                },
            ),
            (
                System::new(vec![Node::new(Id), Node::new(Id).graph(vec![1., -2.])]),
                SystemError::NegativeEdge {
                    from: 1,
                    to: 1,
                    weight: -2.,
                },
            ),
            (
                System::new(vec![Node::new(Id).graph(vec![0., 1.]), Node::new(Id).weight(0.)]),
                SystemError::DeadEnd { node: 0 },
            ),
        ];
        for (system, want) in cases {
            let got = system.check().expect_err("bad system passed check");
            // NaN != NaN, so compare the variant by its message
            assert_eq!(got.to_string(), want.to_string());
        }
    }

    #[test]
    fn prep_reaches_final() {
        let mut s = System::new(vec![Node::new(Prepped(false))]).with_final(Prepped(false));
        s.prep();
        let mut rng = ChaosRng::seed_from_u64(0);
        let p = Point::default();
        assert_eq!(s.nodes[0].func.calc(p, &mut rng), p);
        assert_eq!(s.final_func.as_ref().map(|f| f.calc(p, &mut rng)), Some(p));
    }

    #[test]
    fn missing_edges_default_to_one() {
        let s = System::new(vec![
            Node::new(Id).weight(2.).graph(vec![0.5]),
            Node::new(Id).weight(3.),
        ]);
        assert_eq!(s.effective_weight(0, 0), 1.);
        assert_eq!(s.effective_weight(0, 1), 3.);
        assert_eq!(s.effective_weight(1, 0), 2.);
    }
}
