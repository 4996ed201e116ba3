// ── Statechart definition ──
//
// Static structure of a hierarchical machine: states with parent links,
// the initial child of every composite state, terminal states, and the
// transition table keyed by (source state, event). Lookup walks from
// the innermost active state outwards, so a transition declared on a
// composite state applies to every state nested in it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

/// Identifier of a state. Plain `Copy` enums in practice.
pub trait StateId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}
impl<T> StateId for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Identifier of an event. Payloads travel outside the event.
pub trait EventId: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}
impl<T> EventId for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChartError {
    #[error("state {0} is declared twice")]
    DuplicateState(String),

    #[error("state {0} is referenced but never declared")]
    UnknownState(String),

    #[error("composite state {0} has no initial child")]
    MissingInitial(String),

    #[error("{child} is not a direct child of {composite}")]
    InitialNotChild { composite: String, child: String },

    #[error("the root state {0} must be top-level")]
    RootNotTopLevel(String),
}

/// A resolved transition: which states to leave, innermost first, and
/// which to enter, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<S> {
    pub source: S,
    pub target: S,
    pub exits: Vec<S>,
    pub entries: Vec<S>,
}

#[derive(Debug, Clone)]
pub struct Chart<S, E> {
    root: S,
    states: HashSet<S>,
    parents: HashMap<S, S>,
    initial: HashMap<S, S>,
    terminal: HashSet<S>,
    transitions: HashMap<(S, E), S>,
}

impl<S: StateId, E: EventId> Chart<S, E> {
    pub fn builder(root: S) -> ChartBuilder<S, E> {
        ChartBuilder::new(root)
    }

    pub fn root(&self) -> S {
        self.root
    }

    pub fn parent(&self, state: S) -> Option<S> {
        self.parents.get(&state).copied()
    }

    pub fn contains(&self, state: S) -> bool {
        self.states.contains(&state)
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// `state` itself followed by its ancestors, innermost first.
    pub fn ancestry(&self, state: S) -> Vec<S> {
        let mut chain = vec![state];
        let mut cursor = state;
        while let Some(parent) = self.parent(cursor) {
            chain.push(parent);
            cursor = parent;
        }
        chain
    }

    /// Whether `state` is `outer` or nested somewhere inside it.
    pub fn is_within(&self, state: S, outer: S) -> bool {
        self.ancestry(state).contains(&outer)
    }

    /// States entered when the machine starts, outermost first.
    pub fn start_path(&self) -> Vec<S> {
        self.entry_path(None, self.root)
    }

    /// Resolve `event` against the innermost active state.
    pub fn resolve(&self, active: S, event: E) -> Option<Step<S>> {
        let (source, target) = self
            .ancestry(active)
            .into_iter()
            .find_map(|s| self.transitions.get(&(s, event)).map(|t| (s, *t)))?;

        // Transitions are external: the domain is the innermost state that
        // strictly contains both ends, so a self or parent target is re-entered.
        let target_ancestors = &self.ancestry(target)[1..];
        let domain = self.ancestry(source)[1..]
            .iter()
            .copied()
            .find(|s| target_ancestors.contains(s));

        let exits = self
            .ancestry(active)
            .into_iter()
            .take_while(|s| Some(*s) != domain)
            .collect();
        let entries = self.entry_path(domain, target);

        Some(Step {
            source,
            target,
            exits,
            entries,
        })
    }

    /// Ancestors of `target` below `domain`, `target`, then its initial descendants.
    fn entry_path(&self, domain: Option<S>, target: S) -> Vec<S> {
        let mut path: Vec<S> = self
            .ancestry(target)
            .into_iter()
            .take_while(|s| Some(*s) != domain)
            .collect();
        path.reverse();
        let mut cursor = target;
        while let Some(child) = self.initial.get(&cursor) {
            path.push(*child);
            cursor = *child;
        }
        path
    }
}

/// Fluent builder for a [`Chart`]. `build` validates the structure.
#[derive(Debug)]
pub struct ChartBuilder<S, E> {
    root: S,
    order: Vec<S>,
    parents: HashMap<S, S>,
    initial: HashMap<S, S>,
    terminal: HashSet<S>,
    transitions: Vec<(S, E, S)>,
    duplicate: Option<S>,
}

impl<S: StateId, E: EventId> ChartBuilder<S, E> {
    pub fn new(root: S) -> Self {
        Self {
            root,
            order: Vec::new(),
            parents: HashMap::new(),
            initial: HashMap::new(),
            terminal: HashSet::new(),
            transitions: Vec::new(),
            duplicate: None,
        }
    }

    fn declare(&mut self, state: S) {
        if self.order.contains(&state) {
            self.duplicate.get_or_insert(state);
        } else {
            self.order.push(state);
        }
    }

    /// Declare a top-level state.
    #[must_use]
    pub fn state(mut self, state: S) -> Self {
        self.declare(state);
        self
    }

    /// Declare `state` as a child of `parent`.
    #[must_use]
    pub fn substate(mut self, parent: S, state: S) -> Self {
        self.declare(state);
        self.parents.insert(state, parent);
        self
    }

    #[must_use]
    pub fn initial(mut self, composite: S, child: S) -> Self {
        self.initial.insert(composite, child);
        self
    }

    /// Entering a terminal state stops the machine.
    #[must_use]
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    #[must_use]
    pub fn on(mut self, source: S, event: E, target: S) -> Self {
        self.transitions.push((source, event, target));
        self
    }

    pub fn build(self) -> Result<Chart<S, E>, ChartError> {
        let name = |s: &S| format!("{s:?}");
        if let Some(dup) = self.duplicate {
            return Err(ChartError::DuplicateState(name(&dup)));
        }
        let states: HashSet<S> = self.order.iter().copied().collect();
        let known = |s: &S| {
            if states.contains(s) {
                Ok(())
            } else {
                Err(ChartError::UnknownState(name(s)))
            }
        };

        known(&self.root)?;
        if self.parents.contains_key(&self.root) {
            return Err(ChartError::RootNotTopLevel(name(&self.root)));
        }
        for parent in self.parents.values() {
            known(parent)?;
        }
        for (composite, child) in &self.initial {
            known(composite)?;
            known(child)?;
            if self.parents.get(child) != Some(composite) {
                return Err(ChartError::InitialNotChild {
                    composite: name(composite),
                    child: name(child),
                });
            }
        }
        for parent in self.parents.values() {
            if !self.initial.contains_key(parent) {
                return Err(ChartError::MissingInitial(name(parent)));
            }
        }
        for state in &self.terminal {
            known(state)?;
        }
        let mut transitions = HashMap::with_capacity(self.transitions.len());
        for (source, event, target) in self.transitions {
            known(&source)?;
            known(&target)?;
            transitions.insert((source, event), target);
        }

        Ok(Chart {
            root: self.root,
            states,
            parents: self.parents,
            initial: self.initial,
            terminal: self.terminal,
            transitions,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        Top,
        Normal,
        Wait,
        Work,
        Recover,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum E {
        Go,
        Fault,
        Finished,
        Again,
        Stop,
    }

    fn chart() -> Chart<S, E> {
        Chart::builder(S::Top)
            .state(S::Top)
            .state(S::Done)
            .substate(S::Top, S::Normal)
            .substate(S::Top, S::Recover)
            .substate(S::Normal, S::Wait)
            .substate(S::Normal, S::Work)
            .initial(S::Top, S::Normal)
            .initial(S::Normal, S::Wait)
            .terminal(S::Done)
            .on(S::Wait, E::Go, S::Work)
            .on(S::Work, E::Finished, S::Normal)
            .on(S::Work, E::Again, S::Work)
            .on(S::Normal, E::Fault, S::Recover)
            .on(S::Top, E::Stop, S::Done)
            .build()
            .unwrap()
    }

    #[test]
    fn start_enters_initial_descendants() {
        assert_eq!(chart().start_path(), vec![S::Top, S::Normal, S::Wait]);
    }

    #[test]
    fn sibling_transition_stays_inside_parent() {
        let step = chart().resolve(S::Wait, E::Go).unwrap();
        assert_eq!(step.exits, vec![S::Wait]);
        assert_eq!(step.entries, vec![S::Work]);
    }

    #[test]
    fn inherited_transition_leaves_the_whole_composite() {
        let step = chart().resolve(S::Work, E::Fault).unwrap();
        assert_eq!(step.source, S::Normal);
        assert_eq!(step.exits, vec![S::Work, S::Normal]);
        assert_eq!(step.entries, vec![S::Recover]);
    }

    #[test]
    fn targeting_the_parent_reenters_its_initial_child() {
        let step = chart().resolve(S::Work, E::Finished).unwrap();
        assert_eq!(step.exits, vec![S::Work, S::Normal]);
        assert_eq!(step.entries, vec![S::Normal, S::Wait]);
    }

    #[test]
    fn self_transition_is_external() {
        let step = chart().resolve(S::Work, E::Again).unwrap();
        assert_eq!(step.exits, vec![S::Work]);
        assert_eq!(step.entries, vec![S::Work]);
    }

    #[test]
    fn top_level_transition_exits_everything() {
        let chart = chart();
        let step = chart.resolve(S::Wait, E::Stop).unwrap();
        assert_eq!(step.exits, vec![S::Wait, S::Normal, S::Top]);
        assert_eq!(step.entries, vec![S::Done]);
        assert!(chart.is_terminal(S::Done));
    }

    #[test]
    fn unknown_event_does_not_resolve() {
        assert!(chart().resolve(S::Recover, E::Go).is_none());
    }

    #[test]
    fn composite_without_initial_is_rejected() {
        let err = Chart::<S, E>::builder(S::Top)
            .state(S::Top)
            .substate(S::Top, S::Wait)
            .build()
            .unwrap_err();
        assert_eq!(err, ChartError::MissingInitial("Top".into()));
    }

    #[test]
    fn initial_must_be_a_direct_child() {
        let err = Chart::<S, E>::builder(S::Top)
            .state(S::Top)
            .substate(S::Top, S::Normal)
            .substate(S::Normal, S::Wait)
            .initial(S::Top, S::Wait)
            .initial(S::Normal, S::Wait)
            .build()
            .unwrap_err();
        assert!(matches!(err, ChartError::InitialNotChild { .. }));
    }
}
