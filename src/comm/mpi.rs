//! One OS process per rank over MPI.
//!
//! Tags travel as the integer codes from `Tag::code`. Receives take the next
//! message from the peer whatever its tag and then check it, so a message
//! out of protocol order is a `ProtocolError` here too instead of a hang.
//! MPI's default error handler aborts the whole job when a transfer fails.

use ::mpi::request;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::{Communicator as _, CommunicatorCollectives, Destination, Source};

use super::{leader_barrier, Communicator, Tag};
use crate::error::{Error, Result};

/// This process's endpoint into an MPI communicator
pub struct MpiComm {
    world: SimpleCommunicator,
    rank: usize,
    size: usize,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Result<Self> {
        let rank = usize::try_from(world.rank()).map_err(|_| Error::CommunicationError {
            rank: 0,
            message: format!("MPI reported negative rank {}", world.rank()),
        })?;
        let size = usize::try_from(world.size()).map_err(|_| Error::CommunicationError {
            rank,
            message: format!("MPI reported negative world size {}", world.size()),
        })?;
        Ok(Self { world, rank, size })
    }

    pub fn world(&self) -> &SimpleCommunicator {
        &self.world
    }

    fn peer(&self, peer: usize) -> Result<i32> {
        if peer >= self.size {
            return Err(Error::CommunicationError {
                rank: self.rank,
                message: format!("rank {} is outside a world of {}", peer, self.size),
            });
        }
        i32::try_from(peer).map_err(|_| Error::CommunicationError {
            rank: self.rank,
            message: format!("rank {} does not fit an MPI rank", peer),
        })
    }

    fn tag_code(&self, tag: Tag) -> Result<i32> {
        tag.code().ok_or_else(|| Error::CommunicationError {
            rank: self.rank,
            message: format!("{:?} has no MPI tag", tag),
        })
    }

    /// Compare the tag a message arrived with against the one expected
    fn check_tag(&self, peer: usize, expected: Tag, code: i32) -> Result<()> {
        match Tag::from_code(code) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(Error::ProtocolError {
                rank: self.rank,
                peer,
                expected,
                actual,
            }),
            None => Err(Error::CommunicationError {
                rank: self.rank,
                message: format!("unknown MPI tag {} from rank {}", code, peer),
            }),
        }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    /// Standard-mode send; may wait until `dest` posts its receive
    fn send(&self, dest: usize, tag: Tag, data: Vec<f64>) -> Result<()> {
        let target = self.peer(dest)?;
        let code = self.tag_code(tag)?;
        log::trace!("rank {} -> {}: {:?} ({} values)", self.rank, dest, tag, data.len());

        self.world.process_at_rank(target).send_with_tag(&data[..], code);
        Ok(())
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<f64>> {
        let origin = self.peer(source)?;
        let (payload, status) = self.world.process_at_rank(origin).receive_vec::<f64>();
        self.check_tag(source, tag, status.tag())?;

        log::trace!("rank {} <- {}: {:?} ({} values)", self.rank, source, tag, payload.len());
        Ok(payload)
    }

    /// Non-blocking send paired with a blocking receive, so a ring of
    /// ranks all shifting at once cannot deadlock
    fn send_recv(&self, dest: usize, source: usize, tag: Tag, data: Vec<f64>) -> Result<Vec<f64>> {
        if dest == self.rank && source == self.rank {
            return Ok(data);
        }

        let target = self.peer(dest)?;
        let origin = self.peer(source)?;
        let code = self.tag_code(tag)?;

        let (payload, status) = request::scope(|scope| {
            let pending = self
                .world
                .process_at_rank(target)
                .immediate_send_with_tag(scope, &data[..], code);
            let received = self.world.process_at_rank(origin).receive_vec::<f64>();
            pending.wait();
            received
        });

        self.check_tag(source, tag, status.tag())?;
        Ok(payload)
    }

    /// Uses the MPI barrier when the whole world takes part; idle ranks
    /// have already left, so smaller groups fall back to point-to-point
    fn barrier(&self, group: &[usize], round: usize) -> Result<()> {
        if group.len() == self.size {
            self.world.barrier();
            return Ok(());
        }
        leader_barrier(self, group, round)
    }
}
