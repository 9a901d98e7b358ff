//! In-process world: one OS thread per rank, connected by channels.
//!
//! Every ordered pair of ranks gets its own unbounded channel, so sends never
//! block and messages between two ranks stay in order. Each sender half is
//! owned by exactly one rank. When a rank returns (or panics) its endpoints
//! are dropped, and any peer still waiting on it sees a disconnect instead of
//! blocking forever.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use super::{Communicator, Tag};
use crate::error::{Error, Result};

/// A tagged payload in flight between two ranks
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub tag: Tag,
    pub payload: Vec<f64>,
}

/// One rank's endpoint into a `LocalWorld`
pub struct LocalComm {
    rank: usize,
    /// Indexed by destination rank
    outboxes: Vec<Sender<Message>>,
    /// Indexed by source rank
    inboxes: Vec<Receiver<Message>>,
}

impl LocalComm {
    fn peer_error(&self, peer: usize) -> Error {
        Error::CommunicationError {
            rank: self.rank,
            message: format!("rank {} is outside a world of {}", peer, self.size()),
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, data: Vec<f64>) -> Result<()> {
        let outbox = self.outboxes.get(dest).ok_or_else(|| self.peer_error(dest))?;
        log::trace!("rank {} -> {}: {:?} ({} values)", self.rank, dest, tag, data.len());

        outbox
            .send(Message { tag, payload: data })
            .map_err(|_| Error::PeerDisconnected { rank: self.rank, peer: dest })
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<f64>> {
        let inbox = self.inboxes.get(source).ok_or_else(|| self.peer_error(source))?;
        let message = inbox
            .recv()
            .map_err(|_| Error::PeerDisconnected { rank: self.rank, peer: source })?;

        if message.tag != tag {
            return Err(Error::ProtocolError {
                rank: self.rank,
                peer: source,
                expected: tag,
                actual: message.tag,
            });
        }

        log::trace!("rank {} <- {}: {:?} ({} values)", self.rank, source, tag, message.payload.len());
        Ok(message.payload)
    }
}

/// A fixed set of ranks running inside this process
pub struct LocalWorld {
    comms: Vec<LocalComm>,
}

impl LocalWorld {
    /// Wire up `size` ranks with a full channel mesh
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::ValidationError("a world needs at least one rank".to_string()));
        }

        let mut outboxes: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut inboxes: Vec<Vec<Receiver<Message>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();

        // outboxes[source] fills in destination order, inboxes[dest] in source order
        for dest in 0..size {
            for source in 0..size {
                let (tx, rx) = mpsc::channel();
                outboxes[source].push(tx);
                inboxes[dest].push(rx);
            }
        }

        let comms = outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalComm { rank, outboxes, inboxes })
            .collect();

        Ok(Self { comms })
    }

    pub fn size(&self) -> usize {
        self.comms.len()
    }

    /// Hand out the endpoints for callers that manage their own threads
    pub fn into_comms(self) -> Vec<LocalComm> {
        self.comms
    }

    /// Run `f` on every rank concurrently and collect the results in rank order.
    ///
    /// If any rank fails the whole run fails. The reported error is the first
    /// one (by rank) that is not merely a peer noticing someone else's exit.
    pub fn run<T, F>(self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalComm) -> Result<T> + Sync,
    {
        let size = self.comms.len();
        let f = &f;

        let outcomes: Vec<Result<T>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(size);
            for comm in self.comms {
                let rank = comm.rank;
                let spawned = thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(scope, move || {
                        let result = f(comm);
                        if let Err(e) = &result {
                            if e.is_cascade() {
                                log::debug!("rank {} stopped: {}", rank, e);
                            } else {
                                log::error!("rank {} aborted: {}", rank, e);
                            }
                        }
                        result
                    });
                handles.push((rank, spawned));
            }

            handles
                .into_iter()
                .map(|(rank, spawned)| match spawned {
                    Ok(handle) => handle.join().unwrap_or(Err(Error::RankPanicked(rank))),
                    Err(e) => Err(Error::IoError(e)),
                })
                .collect()
        });

        let mut values = Vec::with_capacity(size);
        let mut failure: Option<Error> = None;
        for outcome in outcomes {
            match outcome {
                Ok(value) => values.push(value),
                Err(e) => {
                    failure = match failure {
                        Some(prev) if prev.is_cascade() && !e.is_cascade() => Some(e),
                        Some(prev) => Some(prev),
                        None => Some(e),
                    };
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ranks_rejected() {
        assert!(LocalWorld::new(0).is_err());
    }

    #[test]
    fn test_point_to_point_in_order() {
        let results = LocalWorld::new(2).unwrap().run(|comm| {
            if comm.rank() == 0 {
                comm.send(1, Tag::ScatterA, vec![1.0])?;
                comm.send(1, Tag::ScatterB, vec![2.0, 3.0])?;
                Ok(Vec::new())
            } else {
                let mut got = comm.recv(0, Tag::ScatterA)?;
                got.extend(comm.recv(0, Tag::ScatterB)?);
                Ok(got)
            }
        }).unwrap();

        assert_eq!(results[1], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unexpected_tag_is_protocol_error() {
        let result = LocalWorld::new(2).unwrap().run(|comm| {
            if comm.rank() == 0 {
                comm.send(1, Tag::Rotate(1), vec![0.0])
            } else {
                comm.recv(0, Tag::Broadcast(1)).map(|_| ())
            }
        });

        match result {
            Err(Error::ProtocolError { rank, peer, expected, actual }) => {
                assert_eq!((rank, peer), (1, 0));
                assert_eq!(expected, Tag::Broadcast(1));
                assert_eq!(actual, Tag::Rotate(1));
            }
            other => panic!("expected protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_failed_rank_aborts_waiting_peers() {
        // Rank 2 gives up before sending; ranks 0 and 1 wait on it and must not hang
        let result = LocalWorld::new(3).unwrap().run(|comm| {
            match comm.rank() {
                2 => Err(Error::CommunicationError {
                    rank: 2,
                    message: "link down".to_string(),
                }),
                1 => comm.recv(2, Tag::Gather).map(|_| ()),
                _ => comm.recv(1, Tag::Gather).map(|_| ()),
            }
        });

        match result {
            Err(Error::CommunicationError { rank, message }) => {
                assert_eq!(rank, 2);
                assert_eq!(message, "link down");
            }
            other => panic!("expected root cause, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_panicking_rank_is_reported() {
        let result = LocalWorld::new(2).unwrap().run(|comm| {
            if comm.rank() == 1 {
                panic!("rank 1 exploded");
            }
            comm.recv(1, Tag::Gather).map(|_| ())
        });

        assert!(matches!(result, Err(Error::RankPanicked(1))));
    }

    #[test]
    fn test_unknown_peer() {
        let result = LocalWorld::new(1).unwrap().run(|comm| comm.send(3, Tag::Gather, Vec::new()));
        assert!(matches!(result, Err(Error::CommunicationError { rank: 0, .. })));
    }

    #[test]
    fn test_into_comms_size() {
        let comms = LocalWorld::new(3).unwrap().into_comms();
        assert_eq!(comms.len(), 3);
        assert!(comms.iter().enumerate().all(|(rank, c)| c.rank() == rank && c.size() == 3));
    }
}
