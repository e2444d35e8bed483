//! Message pipeline: an ordered list of pure stages.
//!
//! Each stage looks at a message and the direction it travels and
//! returns a [`Verdict`]: pass it on (possibly rewritten), answer it
//! straight back to the sender, or drop it. The first stage that doesn't
//! forward ends the run. Stages know nothing about the transport, so the
//! same pipeline works over WebSocket, in-memory pairs, or in a unit test.

use crate::{DownwardDuty, Envelope, UpwardDuty};

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Downend → Upend.
    Upward,
    /// Upend → Downend.
    Downward,
}

/// What a stage decided. `M` is the message type, `R` the reply type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<M, R> {
    Forward(M),
    SendBack(R),
    Drop,
}

type Stage<M, R> = Box<dyn Fn(M, Direction) -> Verdict<M, R> + Send + Sync>;

/// An ordered list of stages.
pub struct Pipeline<M, R> {
    stages: Vec<Stage<M, R>>,
}

impl<M, R> Pipeline<M, R> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage; stages run in insertion order.
    pub fn with_stage<F>(mut self, stage: F) -> Self
    where
        F: Fn(M, Direction) -> Verdict<M, R> + Send + Sync + 'static,
    {
        self.stages.push(Box::new(stage));
        self
    }

    /// Runs `message` through every stage until one doesn't forward.
    pub fn process(&self, message: M, direction: Direction) -> Verdict<M, R> {
        let mut current = message;
        for stage in &self.stages {
            match stage(current, direction) {
                Verdict::Forward(next) => current = next,
                other => return other,
            }
        }
        Verdict::Forward(current)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<M, R> Default for Pipeline<M, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers an upward `Ping` with a `Pong` carrying the same counter.
pub fn answer_pings(
    envelope: Envelope<UpwardDuty>,
    direction: Direction,
) -> Verdict<Envelope<UpwardDuty>, Envelope<DownwardDuty>> {
    match (direction, &envelope.duty) {
        (Direction::Upward, UpwardDuty::Ping { counter }) => {
            Verdict::SendBack(Envelope::new(DownwardDuty::Pong { counter: *counter }))
        }
        _ => Verdict::Forward(envelope),
    }
}

/// Drops upward commands that carry no tag: nobody could ever be told
/// their outcome.
pub fn drop_untagged_commands(
    envelope: Envelope<UpwardDuty>,
    direction: Direction,
) -> Verdict<Envelope<UpwardDuty>, Envelope<DownwardDuty>> {
    match (direction, &envelope.duty, &envelope.tag) {
        (Direction::Upward, UpwardDuty::Command { .. }, None) => Verdict::Drop,
        _ => Verdict::Forward(envelope),
    }
}
