//! Ordering of sequential nodes and the predecessor-watch wait.
//!
//! Locks and leadership both queue contenders as sequential children of one
//! directory. A contender whose node is not first watches only the node
//! immediately ahead of it, so a release wakes exactly one waiter.

use crate::dispatcher::{Wake, WatchDispatcher};
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::join_path;
use crate::session::SessionManager;
use tokio::time::Instant;
use tracing::trace;

/// Width of the store-assigned sequence suffix.
pub const SEQUENCE_DIGITS: usize = 10;

/// Something with a stable identifier.
pub trait Identifiable {
    fn id(&self) -> &str;
}

/// Something ordered by a store-assigned sequence number.
pub trait Sequenced {
    fn sequence(&self) -> u64;
}

/// Parse the sequence suffix of a node name.
pub fn parse_sequence(name: &str) -> Option<u64> {
    let start = name.len().checked_sub(SEQUENCE_DIGITS)?;
    let suffix = name.get(start..)?;
    if !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// A sequential child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedNode {
    name: String,
    sequence: u64,
}

impl SequencedNode {
    /// Parse a child name carrying `prefix` and a sequence suffix.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        if !name.starts_with(prefix) {
            return None;
        }
        parse_sequence(name).map(|sequence| Self {
            name: name.to_string(),
            sequence,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Identifiable for SequencedNode {
    fn id(&self) -> &str {
        &self.name
    }
}

impl Sequenced for SequencedNode {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Keep children named `prefix` + sequence, ordered by sequence.
pub fn sort_sequenced<I>(children: I, prefix: &str) -> Vec<SequencedNode>
where
    I: IntoIterator<Item = String>,
{
    let mut nodes: Vec<SequencedNode> = children
        .into_iter()
        .filter_map(|name| SequencedNode::parse(&name, prefix))
        .collect();
    nodes.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    nodes
}

/// Where an id stands in an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Position {
    First,
    Behind(String),
    Absent,
}

pub(crate) fn position<T: Identifiable>(ordered: &[T], id: &str) -> Position {
    match ordered.iter().position(|node| node.id() == id) {
        None => Position::Absent,
        Some(0) => Position::First,
        Some(index) => Position::Behind(ordered[index - 1].id().to_string()),
    }
}

/// Outcome of [`wait_for_turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Turn {
    First,
    TimedOut,
}

/// Wait until `me` is the lowest sequential child of `parent`.
pub(crate) async fn wait_for_turn(
    session: &SessionManager,
    dispatcher: &WatchDispatcher,
    parent: &str,
    prefix: &str,
    me: &str,
    deadline: Option<Instant>,
) -> CoordinationResult<Turn> {
    loop {
        let ordered = sort_sequenced(session.children(parent).await?, prefix);
        let predecessor = match position(&ordered, me) {
            Position::First => return Ok(Turn::First),
            Position::Behind(predecessor) => join_path(parent, &predecessor),
            Position::Absent => {
                return Err(CoordinationError::IllegalState(format!(
                    "node {me} under {parent} disappeared"
                )));
            }
        };

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(Turn::TimedOut);
        }

        let waiter = dispatcher.waiter(&predecessor);
        if session.watch_node(&predecessor).await?.is_none() {
            continue;
        }

        trace!(node = me, %predecessor, "waiting on predecessor");
        if waiter.wait(deadline).await? == Wake::TimedOut {
            return Ok(Turn::TimedOut);
        }
    }
}
