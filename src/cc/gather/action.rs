//! Data-movement actions and the per-rank dependency arena.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Send,
    Recv,
    /// Local copy from the buffer head to `offset`; no network partner.
    Shuffle,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
            Self::Shuffle => "shuffle",
        }
    }
}

/// How received bytes reach the public buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// Written directly into the registered buffer.
    #[default]
    InPlace,
    /// Staged in a temporary message buffer, then copied.
    Buffered,
}

/// Index of an action inside its [`ActionDag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActionId(pub usize);

/// One data movement. Offsets and sizes are in elements, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub round: u32,
    /// Communication partner; the owning rank itself for a shuffle.
    pub partner: usize,
    pub offset: usize,
    pub nelems: usize,
    pub mode: CopyMode,
}

impl Action {
    pub fn send(round: u32, partner: usize, offset: usize, nelems: usize) -> Self {
        Self {
            kind: ActionKind::Send,
            round,
            partner,
            offset,
            nelems,
            mode: CopyMode::InPlace,
        }
    }

    pub fn recv(round: u32, partner: usize, offset: usize, nelems: usize) -> Self {
        Self {
            kind: ActionKind::Recv,
            round,
            partner,
            offset,
            nelems,
            mode: CopyMode::InPlace,
        }
    }

    pub fn shuffle(round: u32, me: usize, offset: usize, nelems: usize) -> Self {
        Self {
            kind: ActionKind::Shuffle,
            round,
            partner: me,
            offset,
            nelems,
            mode: CopyMode::InPlace,
        }
    }

    pub fn with_mode(mut self, mode: CopyMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionNode {
    pub action: Action,
    pub deps: Vec<ActionId>,
}

/// Arena of one rank's actions for one operation.
///
/// Actions are immutable once pushed and referenced by [`ActionId`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionDag {
    rank: usize,
    nodes: Vec<ActionNode>,
}

impl ActionDag {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            nodes: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn add(&mut self, action: Action, deps: &[ActionId]) -> ActionId {
        let id = ActionId(self.nodes.len());
        debug_assert!(deps.iter().all(|d| d.0 < id.0), "dependency on a later action");
        self.nodes.push(ActionNode {
            action,
            deps: deps.to_vec(),
        });
        id
    }

    /// Appends `action` after `prev`, if any.
    pub fn chain(&mut self, prev: Option<ActionId>, action: Action) -> ActionId {
        match prev {
            Some(p) => self.add(action, &[p]),
            None => self.add(action, &[]),
        }
    }

    pub fn get(&self, id: ActionId) -> &Action {
        &self.nodes[id.0].action
    }

    pub fn deps(&self, id: ActionId) -> &[ActionId] {
        &self.nodes[id.0].deps
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ActionId> + '_ {
        (0..self.nodes.len()).map(ActionId)
    }

    /// Actions in insertion order, which is always a valid execution order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> + '_ {
        self.nodes.iter().map(|n| &n.action)
    }

    /// True when every action depends on exactly the one before it.
    pub fn is_chain(&self) -> bool {
        self.nodes.iter().enumerate().all(|(i, n)| match i {
            0 => n.deps.is_empty(),
            _ => n.deps == [ActionId(i - 1)],
        })
    }
}
