//! Message passing between ranks.
//!
//! `Communicator` is the seam between the algorithm and a transport. A
//! transport only provides point-to-point `send` and blocking `recv`; the
//! collectives the Fox rounds need are built on top of those here.
//!
//! Two transports ship with the crate: `LocalWorld` runs every rank as a
//! thread of the current process, and `MpiComm` (feature `mpi`) runs one OS
//! process per rank.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use local::{LocalComm, LocalWorld, Message};
#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;

use crate::error::{Error, Result};
use crate::grid::GridPolicy;

/// Sent instead of `n` when the root rejected its inputs
const REJECTED_DIMENSION: f64 = -1.0;

/// Number of distinct tag kinds packed into the low bits of a tag code
const TAG_KINDS: i32 = 8;

/// Identifies which protocol step a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Preliminary broadcast of the matrix side
    Dimension,
    /// Initial A block
    ScatterA,
    /// Initial B block
    ScatterB,
    /// A block broadcast along a grid row in the given round
    Broadcast(usize),
    /// B block shifted up a grid column in the given round
    Rotate(usize),
    /// Arrival at the end-of-round barrier
    Barrier(usize),
    /// Release from the end-of-round barrier
    Release(usize),
    /// Accumulated C block on its way back to the root
    Gather,
}

impl Tag {
    /// Integer form for transports with numeric tags: `step * 8 + kind`.
    ///
    /// `None` when the step is too large to encode.
    pub fn code(self) -> Option<i32> {
        let (kind, step) = match self {
            Tag::Dimension => (0, 0),
            Tag::ScatterA => (1, 0),
            Tag::ScatterB => (2, 0),
            Tag::Gather => (3, 0),
            Tag::Broadcast(step) => (4, step),
            Tag::Rotate(step) => (5, step),
            Tag::Barrier(step) => (6, step),
            Tag::Release(step) => (7, step),
        };
        i32::try_from(step).ok()?.checked_mul(TAG_KINDS)?.checked_add(kind)
    }

    pub fn from_code(code: i32) -> Option<Tag> {
        if code < 0 {
            return None;
        }
        let step = usize::try_from(code / TAG_KINDS).ok()?;
        let tag = match code % TAG_KINDS {
            0 if step == 0 => Tag::Dimension,
            1 if step == 0 => Tag::ScatterA,
            2 if step == 0 => Tag::ScatterB,
            3 if step == 0 => Tag::Gather,
            4 => Tag::Broadcast(step),
            5 => Tag::Rotate(step),
            6 => Tag::Barrier(step),
            7 => Tag::Release(step),
            _ => return None,
        };
        Some(tag)
    }
}

/// What the root announces before any block moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemHeader {
    /// Matrix side
    pub n: usize,
    /// Policy every rank derives the grid with
    pub policy: GridPolicy,
}

/// Point-to-point transport plus the collectives built from it
pub trait Communicator {
    /// This rank
    fn rank(&self) -> usize;

    /// Number of ranks in the world
    fn size(&self) -> usize;

    /// Hand `data` to the transport for `dest`.
    ///
    /// The default `send_recv` relies on this returning before the matching
    /// receive is posted. Transports whose sends can block on the receiver
    /// must override `send_recv`.
    fn send(&self, dest: usize, tag: Tag, data: Vec<f64>) -> Result<()>;

    /// Block until the next message from `source` arrives.
    ///
    /// Messages between a pair of ranks arrive in the order they were sent. A
    /// message carrying any tag other than `tag` is a protocol error.
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<f64>>;

    /// One-to-many copy of `data` from `root` to every other rank in `group`.
    ///
    /// Only the root supplies a payload; every member returns the same data.
    fn broadcast(&self, root: usize, group: &[usize], tag: Tag, data: Option<Vec<f64>>) -> Result<Vec<f64>> {
        if self.rank() != root {
            return self.recv(root, tag);
        }

        let data = data.ok_or_else(|| Error::CommunicationError {
            rank: root,
            message: format!("broadcast root has no payload for {:?}", tag),
        })?;

        for &member in group.iter().filter(|&&member| member != root) {
            self.send(member, tag, data.clone())?;
        }
        Ok(data)
    }

    /// Send to `dest` and receive from `source` in one step
    fn send_recv(&self, dest: usize, source: usize, tag: Tag, data: Vec<f64>) -> Result<Vec<f64>> {
        let rank = self.rank();
        if dest == rank && source == rank {
            return Ok(data);
        }

        self.send(dest, tag, data)?;
        self.recv(source, tag)
    }

    /// Wait until every rank in `group` has reached the end of `round`.
    ///
    /// The first member of the group collects one arrival from each of the
    /// others, then releases them.
    fn barrier(&self, group: &[usize], round: usize) -> Result<()> {
        leader_barrier(self, group, round)
    }

    /// Share the root's matrix side and grid policy with the whole world.
    ///
    /// The root passes `None` when it rejected its inputs; every rank then
    /// gets `None` back and can stop before any block is exchanged. What
    /// other ranks pass is ignored.
    fn broadcast_dimension(&self, root: usize, header: Option<ProblemHeader>) -> Result<Option<ProblemHeader>> {
        let world: Vec<usize> = (0..self.size()).collect();
        let payload = if self.rank() == root {
            Some(match header {
                Some(h) => vec![h.n as f64, f64::from(h.policy.code())],
                None => vec![REJECTED_DIMENSION, 0.0],
            })
        } else {
            None
        };

        let data = self.broadcast(root, &world, Tag::Dimension, payload)?;
        match data.as_slice() {
            [n, _] if *n < 0.0 => Ok(None),
            [n, code] => {
                let policy = GridPolicy::from_code(*code as u8)
                    .filter(|p| f64::from(p.code()) == *code)
                    .ok_or_else(|| Error::CommunicationError {
                        rank: self.rank(),
                        message: format!("unknown grid policy code {}", code),
                    })?;
                Ok(Some(ProblemHeader { n: *n as usize, policy }))
            }
            other => Err(Error::BlockSizeMismatch {
                expected: 2,
                actual: other.len(),
            }),
        }
    }
}

/// Barrier built from point-to-point messages.
///
/// The first member of `group` collects one arrival from each of the others,
/// then releases them. Ranks outside the group take no part.
pub fn leader_barrier<C: Communicator + ?Sized>(comm: &C, group: &[usize], round: usize) -> Result<()> {
    let (leader, others) = match group.split_first() {
        Some(split) => split,
        None => return Ok(()),
    };

    if comm.rank() == *leader {
        for &member in others {
            comm.recv(member, Tag::Barrier(round))?;
        }
        for &member in others {
            comm.send(member, Tag::Release(round), Vec::new())?;
        }
    } else {
        comm.send(*leader, Tag::Barrier(round), Vec::new())?;
        comm.recv(*leader, Tag::Release(round))?;
    }
    Ok(())
}
