use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

use crate::domain::{InverterId, Pwr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    #[strum(serialize = "=")]
    Equals,
    #[strum(serialize = "<=")]
    LessOrEquals,
    #[strum(serialize = ">=")]
    GreaterOrEquals,
}

/// How long a constraint stays in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConstraintScope {
    /// Survives until removed by its source
    Static,
    /// Discarded before the next cycle's control phase
    Cycle,
}

/// What a constraint restricts: one inverter, the sum of an ESS's
/// inverters, or the sum over every inverter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Inverter(InverterId),
    Ess(String),
    All,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Inverter(id) => write!(f, "{}", id),
            Target::Ess(id) => write!(f, "{}", id),
            Target::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(u64);

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub source: String,
    pub target: Target,
    pub pwr: Pwr,
    pub relationship: Relationship,
    pub value: i64,
    pub scope: ConstraintScope,
}

impl Constraint {
    /// A constraint that is not part of any collection, for feasibility checks.
    pub fn candidate(source: impl Into<String>, target: Target, pwr: Pwr, relationship: Relationship, value: i64) -> Self {
        Self {
            id: ConstraintId(0),
            source: source.into(),
            target,
            pwr,
            relationship,
            value,
            scope: ConstraintScope::Cycle,
        }
    }

    /// Closed interval of sums this constraint admits.
    pub fn bounds(&self) -> (i64, i64) {
        match self.relationship {
            Relationship::Equals => (self.value, self.value),
            Relationship::LessOrEquals => (i64::MIN, self.value),
            Relationship::GreaterOrEquals => (self.value, i64::MAX),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} {} {} ({})",
            self.source,
            self.target,
            self.pwr,
            self.relationship,
            self.value,
            self.pwr.unit(),
            self.scope
        )
    }
}

/// Constraints registered by control strategies.
///
/// Owned by the engine and handed to the solver explicitly. Static and
/// cycle constraints are kept apart; each list preserves registration order,
/// which is also the precedence order inside the scope.
#[derive(Debug, Default, Clone)]
pub struct ConstraintCollection {
    statics: Vec<Constraint>,
    cycle: Vec<Constraint>,
    next_id: u64,
}

impl ConstraintCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        source: impl Into<String>,
        target: Target,
        pwr: Pwr,
        relationship: Relationship,
        value: i64,
        scope: ConstraintScope,
    ) -> ConstraintId {
        self.next_id += 1;
        let id = ConstraintId(self.next_id);
        let constraint = Constraint {
            id,
            source: source.into(),
            target,
            pwr,
            relationship,
            value,
            scope,
        };
        match scope {
            ConstraintScope::Static => self.statics.push(constraint),
            ConstraintScope::Cycle => self.cycle.push(constraint),
        }
        id
    }

    pub fn get(&self, id: ConstraintId) -> Option<&Constraint> {
        self.statics.iter().chain(self.cycle.iter()).find(|c| c.id == id)
    }

    /// Updates a constraint in place, keeping its precedence position.
    /// Returns false if the id is unknown.
    pub fn set_value(&mut self, id: ConstraintId, value: i64) -> bool {
        match self
            .statics
            .iter_mut()
            .chain(self.cycle.iter_mut())
            .find(|c| c.id == id)
        {
            Some(constraint) => {
                constraint.value = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: ConstraintId) -> Option<Constraint> {
        if let Some(pos) = self.statics.iter().position(|c| c.id == id) {
            return Some(self.statics.remove(pos));
        }
        let pos = self.cycle.iter().position(|c| c.id == id)?;
        Some(self.cycle.remove(pos))
    }

    /// Removes every constraint of a source, in both scopes.
    pub fn remove_by_source(&mut self, source: &str) -> usize {
        let before = self.len();
        self.statics.retain(|c| c.source != source);
        self.cycle.retain(|c| c.source != source);
        before - self.len()
    }

    pub fn clear_cycle_constraints(&mut self) -> usize {
        let dropped = self.cycle.len();
        self.cycle.clear();
        dropped
    }

    /// Static constraints first, then cycle constraints, each in
    /// registration order.
    pub fn in_precedence_order(&self, pwr: Pwr) -> Vec<&Constraint> {
        self.statics
            .iter()
            .chain(self.cycle.iter())
            .filter(|c| c.pwr == pwr)
            .collect()
    }

    pub fn statics(&self) -> &[Constraint] {
        &self.statics
    }

    pub fn cycle(&self) -> &[Constraint] {
        &self.cycle
    }

    pub fn len(&self) -> usize {
        self.statics.len() + self.cycle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statics.is_empty() && self.cycle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> ConstraintCollection {
        let mut c = ConstraintCollection::new();
        c.add("limit", Target::All, Pwr::Active, Relationship::LessOrEquals, 5000, ConstraintScope::Cycle);
        c.add("peak", Target::Ess("ess0".into()), Pwr::Active, Relationship::GreaterOrEquals, -3000, ConstraintScope::Static);
        c.add("fix", Target::All, Pwr::Reactive, Relationship::Equals, 0, ConstraintScope::Cycle);
        c.add("peak", Target::All, Pwr::Active, Relationship::Equals, 1000, ConstraintScope::Static);
        c
    }

    #[test]
    fn test_precedence_order() {
        let c = collection();
        let order: Vec<_> = c
            .in_precedence_order(Pwr::Active)
            .iter()
            .map(|c| (c.source.as_str(), c.scope))
            .collect();
        assert_eq!(
            order,
            vec![
                ("peak", ConstraintScope::Static),
                ("peak", ConstraintScope::Static),
                ("limit", ConstraintScope::Cycle),
            ]
        );
        assert_eq!(c.in_precedence_order(Pwr::Reactive).len(), 1);
    }

    #[test]
    fn test_clear_cycle_keeps_statics() {
        let mut c = collection();
        assert_eq!(c.clear_cycle_constraints(), 2);
        assert_eq!(c.len(), 2);
        assert!(c.cycle().is_empty());
        assert!(c.statics().iter().all(|c| c.scope == ConstraintScope::Static));
    }

    #[test]
    fn test_set_value_keeps_position() {
        let mut c = ConstraintCollection::new();
        let first = c.add("a", Target::All, Pwr::Active, Relationship::LessOrEquals, 10, ConstraintScope::Static);
        c.add("b", Target::All, Pwr::Active, Relationship::LessOrEquals, 20, ConstraintScope::Static);
        assert!(c.set_value(first, 99));
        let order = c.in_precedence_order(Pwr::Active);
        assert_eq!(order[0].id, first);
        assert_eq!(order[0].value, 99);
    }

    #[test]
    fn test_remove() {
        let mut c = collection();
        assert_eq!(c.remove_by_source("peak"), 2);
        assert_eq!(c.len(), 2);
        let id = c.cycle()[0].id;
        assert!(c.remove(id).is_some());
        assert!(c.remove(id).is_none());
        assert!(!c.set_value(id, 1));
    }

    #[test]
    fn test_display() {
        let mut c = ConstraintCollection::new();
        let id = c.add("fix", Target::Ess("ess0".into()), Pwr::Active, Relationship::Equals, 4000, ConstraintScope::Cycle);
        assert_eq!(c.get(id).map(|c| c.to_string()).as_deref(), Some("[fix] ess0 P = 4000 W (cycle)"));
        assert_eq!(Relationship::LessOrEquals.to_string(), "<=");
    }
}
