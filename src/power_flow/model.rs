use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::constraints::{Constraint, ConstraintCollection, ConstraintId, Relationship, Target};
use super::distribution::{distribute, DistributionBias, Interval, Member};
use crate::domain::{Inverter, InverterId, Pwr};

pub const DEFAULT_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Cap on water-filling rounds per distribution
    pub max_iterations: usize,
    pub bias: DistributionBias,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            bias: DistributionBias::Weighted,
        }
    }
}

/// Something the solver could not honour, reported with the originating source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SolverEvent {
    /// The constraint lies outside what the hardware can do; its target was
    /// driven to the closest achievable value instead.
    Unmet {
        constraint: ConstraintId,
        source: String,
        pwr: Pwr,
        target: Target,
        requested: i64,
        achieved: i64,
        remainder: i64,
    },
    /// The constraint contradicts one with higher precedence and was ignored.
    Infeasible {
        constraint: ConstraintId,
        source: String,
        pwr: Pwr,
        description: String,
    },
    UnknownTarget {
        constraint: ConstraintId,
        source: String,
        target: Target,
    },
    /// A distribution hit the iteration cap before placing the whole amount.
    IterationLimit { pwr: Pwr, unmet: i64 },
}

impl SolverEvent {
    pub fn source(&self) -> Option<&str> {
        match self {
            SolverEvent::Unmet { source, .. }
            | SolverEvent::Infeasible { source, .. }
            | SolverEvent::UnknownTarget { source, .. } => Some(source),
            SolverEvent::IterationLimit { .. } => None,
        }
    }

    pub fn is_unmet(&self) -> bool {
        matches!(self, SolverEvent::Unmet { .. } | SolverEvent::IterationLimit { .. })
    }

    pub fn is_infeasible(&self) -> bool {
        matches!(self, SolverEvent::Infeasible { .. } | SolverEvent::UnknownTarget { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SolveReport {
    pub events: Vec<SolverEvent>,
    pub iterations: usize,
}

impl SolveReport {
    pub fn unmet(&self) -> usize {
        self.events.iter().filter(|e| e.is_unmet()).count()
    }

    pub fn infeasible(&self) -> usize {
        self.events.iter().filter(|e| e.is_infeasible()).count()
    }

    pub fn merge(&mut self, other: SolveReport) {
        self.events.extend(other.events);
        self.iterations += other.iterations;
    }
}

/// Turns the constraint set into per-inverter setpoints.
///
/// Inverters are grouped as a tree: all inverters, then one group per ESS,
/// then the ESS's inverters (one three-phase unit or three legs). Every group
/// keeps the interval its accepted constraints allow, and a constraint is only
/// accepted if every group can still reach its interval afterwards.
#[derive(Debug, Clone, Default)]
pub struct PowerSolver {
    config: SolverConfig,
}

impl PowerSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
    }

    /// Solves one power type. Inverters not covered by any constraint are
    /// held at zero, or the bound closest to it. With
    /// [`DistributionBias::MovingTowardsTarget`] they hold their last applied
    /// setpoint instead and constrained groups move from there.
    pub fn solve(&self, inverters: &mut [Inverter], constraints: &ConstraintCollection, pwr: Pwr) -> SolveReport {
        let from_last = self.config.bias.starts_from_last();
        let start: Vec<i64> = inverters
            .iter()
            .map(|inv| if from_last { inv.last(pwr) } else { 0 })
            .collect();
        self.run(inverters, constraints.in_precedence_order(pwr), pwr, start)
    }

    /// Solves active and reactive power independently.
    pub fn solve_all(&self, inverters: &mut [Inverter], constraints: &ConstraintCollection) -> SolveReport {
        let mut report = self.solve(inverters, constraints, Pwr::Active);
        report.merge(self.solve(inverters, constraints, Pwr::Reactive));
        report
    }

    /// Applies further constraints on top of the inverters' current `next`
    /// values, moving only what the new constraints require.
    pub fn refine(&self, inverters: &mut [Inverter], constraints: &[Constraint], pwr: Pwr) -> SolveReport {
        let start: Vec<i64> = inverters.iter().map(|inv| inv.next(pwr)).collect();
        let ordered = constraints.iter().filter(|c| c.pwr == pwr).collect();
        self.run(inverters, ordered, pwr, start)
    }

    /// Range a target's power can still take under the registered constraints.
    pub fn extrema(
        &self,
        inverters: &[Inverter],
        constraints: &ConstraintCollection,
        pwr: Pwr,
        target: &Target,
    ) -> Option<(i64, i64)> {
        let mut dispatch = Dispatch::new(inverters, pwr, self.config, None);
        for constraint in constraints.in_precedence_order(pwr) {
            dispatch.apply(constraint);
        }
        let node = dispatch.resolve(target)?;
        let range = dispatch.achievable(node);
        (!range.is_empty()).then_some((range.lo, range.hi))
    }

    /// Whether `candidate` would be accepted after the registered constraints.
    pub fn is_feasible(&self, inverters: &[Inverter], constraints: &ConstraintCollection, candidate: &Constraint) -> bool {
        let mut dispatch = Dispatch::new(inverters, candidate.pwr, self.config, None);
        for constraint in constraints.in_precedence_order(candidate.pwr) {
            dispatch.apply(constraint);
        }
        match dispatch.resolve(&candidate.target) {
            Some(node) => {
                let (lo, hi) = candidate.bounds();
                !dispatch.achievable(node).intersect(Interval::new(lo, hi)).is_empty()
            }
            None => false,
        }
    }

    fn run(&self, inverters: &mut [Inverter], ordered: Vec<&Constraint>, pwr: Pwr, start: Vec<i64>) -> SolveReport {
        let mut dispatch = Dispatch::new(inverters, pwr, self.config, Some(start));
        for constraint in ordered {
            dispatch.apply(constraint);
        }
        for (inverter, value) in inverters.iter_mut().zip(dispatch.values.iter()) {
            inverter.set_next(pwr, *value);
        }
        SolveReport {
            events: dispatch.events,
            iterations: dispatch.iterations,
        }
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    own: Interval,
    weight: u64,
    soc: Option<u8>,
    leaf: Option<usize>,
}

/// Working state of one solve for one power type.
struct Dispatch {
    pwr: Pwr,
    config: SolverConfig,
    nodes: Vec<Node>,
    physical: Vec<Interval>,
    values: Vec<i64>,
    track_values: bool,
    ess_nodes: HashMap<String, usize>,
    leaf_nodes: HashMap<InverterId, usize>,
    events: Vec<SolverEvent>,
    iterations: usize,
}

const ROOT: usize = 0;

impl Dispatch {
    fn new(inverters: &[Inverter], pwr: Pwr, config: SolverConfig, start: Option<Vec<i64>>) -> Self {
        let mut nodes = vec![Node {
            parent: None,
            children: Vec::new(),
            own: Interval::FULL,
            weight: 0,
            soc: None,
            leaf: None,
        }];
        let mut ess_nodes = HashMap::new();
        let mut leaf_nodes = HashMap::new();
        let mut physical = Vec::with_capacity(inverters.len());

        for (index, inverter) in inverters.iter().enumerate() {
            let (min, max) = inverter.bounds(pwr);
            let bounds = Interval::new(min.min(max), max);
            physical.push(bounds);

            let ess = match ess_nodes.get(inverter.ess_id()) {
                Some(&node) => node,
                None => {
                    let node = nodes.len();
                    nodes.push(Node {
                        parent: Some(ROOT),
                        children: Vec::new(),
                        own: Interval::FULL,
                        weight: 0,
                        soc: inverter.soc,
                        leaf: None,
                    });
                    nodes[ROOT].children.push(node);
                    ess_nodes.insert(inverter.ess_id().to_string(), node);
                    node
                }
            };
            let leaf = nodes.len();
            let weight = inverter.weight as u64;
            nodes.push(Node {
                parent: Some(ess),
                children: Vec::new(),
                own: bounds,
                weight,
                soc: inverter.soc,
                leaf: Some(index),
            });
            nodes[ess].children.push(leaf);
            nodes[ess].weight += weight;
            nodes[ROOT].weight += weight;
            leaf_nodes.insert(inverter.id.clone(), leaf);
        }

        let track_values = start.is_some();
        let values = start
            .unwrap_or_default()
            .into_iter()
            .zip(physical.iter())
            .map(|(value, bounds)| bounds.nearest(value))
            .collect();

        Self {
            pwr,
            config,
            nodes,
            physical,
            values,
            track_values,
            ess_nodes,
            leaf_nodes,
            events: Vec::new(),
            iterations: 0,
        }
    }

    fn resolve(&self, target: &Target) -> Option<usize> {
        match target {
            Target::All => Some(ROOT),
            Target::Ess(id) => self.ess_nodes.get(id).copied(),
            Target::Inverter(id) => self.leaf_nodes.get(id).copied(),
        }
    }

    fn sum(&self, node: usize) -> i64 {
        match self.nodes[node].leaf {
            Some(index) => self.values[index],
            None => self.nodes[node]
                .children
                .iter()
                .fold(0i64, |acc, &child| acc.saturating_add(self.sum(child))),
        }
    }

    /// Sums reachable by the group given its own and its descendants' constraints.
    fn range(&self, node: usize) -> Interval {
        let n = &self.nodes[node];
        if n.leaf.is_some() {
            return n.own;
        }
        let mut children = Interval::point(0);
        for &child in &n.children {
            let range = self.range(child);
            if range.is_empty() {
                return range;
            }
            children = children.add(range);
        }
        n.own.intersect(children)
    }

    fn physical(&self, node: usize) -> Interval {
        match self.nodes[node].leaf {
            Some(index) => self.physical[index],
            None => self.nodes[node]
                .children
                .iter()
                .fold(Interval::point(0), |acc, &child| acc.add(self.physical(child))),
        }
    }

    /// Sums reachable by the group while every other group stays feasible.
    fn achievable(&self, node: usize) -> Interval {
        let range = self.range(node);
        let parent = match self.nodes[node].parent {
            Some(parent) => parent,
            None => return range,
        };
        let outer = self.achievable(parent);
        let siblings = self.nodes[parent]
            .children
            .iter()
            .filter(|&&child| child != node)
            .fold(Interval::point(0), |acc, &child| acc.add(self.range(child)));
        range.intersect(Interval::new(
            outer.lo.saturating_sub(siblings.hi),
            outer.hi.saturating_sub(siblings.lo),
        ))
    }

    fn apply(&mut self, constraint: &Constraint) {
        let node = match self.resolve(&constraint.target) {
            Some(node) => node,
            None => {
                self.events.push(SolverEvent::UnknownTarget {
                    constraint: constraint.id,
                    source: constraint.source.clone(),
                    target: constraint.target.clone(),
                });
                return;
            }
        };
        let (lo, hi) = constraint.bounds();
        let wanted = Interval::new(lo, hi);
        let achievable = self.achievable(node);

        if !achievable.intersect(wanted).is_empty() {
            debug!(constraint = %constraint, "constraint accepted");
            self.nodes[node].own = self.nodes[node].own.intersect(wanted);
            self.realize(node, constraint.relationship == Relationship::Equals);
        } else if !achievable.is_empty() && self.physical(node).intersect(wanted).is_empty() {
            let achieved = achievable.nearest_to(wanted);
            debug!(constraint = %constraint, achieved, "constraint beyond physical range");
            self.nodes[node].own = Interval::point(achieved);
            self.realize(node, true);
            self.events.push(SolverEvent::Unmet {
                constraint: constraint.id,
                source: constraint.source.clone(),
                pwr: self.pwr,
                target: constraint.target.clone(),
                requested: constraint.value,
                achieved,
                remainder: wanted.distance(achieved),
            });
        } else {
            debug!(constraint = %constraint, "constraint conflicts with earlier constraints");
            self.events.push(SolverEvent::Infeasible {
                constraint: constraint.id,
                source: constraint.source.clone(),
                pwr: self.pwr,
                description: constraint.to_string(),
            });
        }
    }

    /// Brings the node, then each ancestor, back inside its feasible range.
    fn realize(&mut self, node: usize, fresh: bool) {
        if !self.track_values {
            return;
        }
        let range = self.range(node);
        let current = self.sum(node);
        if fresh && !self.config.bias.starts_from_last() {
            self.assign(node, range.nearest(current));
        } else if !range.contains(current) {
            self.move_to(node, range.nearest(current));
        }

        let mut ancestor = self.nodes[node].parent;
        while let Some(group) = ancestor {
            let range = self.range(group);
            let current = self.sum(group);
            if !range.contains(current) {
                self.move_to(group, range.nearest(current));
            }
            ancestor = self.nodes[group].parent;
        }
    }

    /// Fresh distribution of `total` over the subtree.
    fn assign(&mut self, node: usize, total: i64) {
        if let Some(index) = self.nodes[node].leaf {
            self.values[index] = self.nodes[node].own.nearest(total);
            return;
        }
        let children = self.nodes[node].children.clone();
        let members: Vec<Member> = children
            .iter()
            .map(|&child| {
                let range = self.range(child);
                Member::new(self.nodes[child].weight, range.lo, range.hi).with_soc(self.nodes[child].soc)
            })
            .collect();
        let values = self.distribute(total, &members);
        for (child, value) in children.into_iter().zip(values) {
            self.assign(child, value);
        }
    }

    /// Moves the subtree's sum to `target`, changing members as little as needed.
    fn move_to(&mut self, node: usize, target: i64) {
        if let Some(index) = self.nodes[node].leaf {
            self.values[index] = self.nodes[node].own.nearest(target);
            return;
        }
        let delta = target.saturating_sub(self.sum(node));
        if delta == 0 {
            return;
        }
        let children = self.nodes[node].children.clone();
        let current: Vec<i64> = children.iter().map(|&child| self.sum(child)).collect();
        let members: Vec<Member> = children
            .iter()
            .zip(&current)
            .map(|(&child, &cur)| {
                let range = self.range(child);
                Member::new(
                    self.nodes[child].weight,
                    range.lo.saturating_sub(cur).min(0),
                    range.hi.saturating_sub(cur).max(0),
                )
                .with_soc(self.nodes[child].soc)
            })
            .collect();
        let deltas = self.distribute(delta, &members);
        for ((child, cur), d) in children.into_iter().zip(current).zip(deltas) {
            if d != 0 {
                self.move_to(child, cur.saturating_add(d));
            }
        }
    }

    fn distribute(&mut self, total: i64, members: &[Member]) -> Vec<i64> {
        let result = distribute(total, members, self.config.bias, self.config.max_iterations);
        self.iterations += result.iterations;
        if result.unmet != 0 {
            self.events.push(SolverEvent::IterationLimit {
                pwr: self.pwr,
                unmet: result.unmet,
            });
        }
        result.values
    }
}
