//! Virtual q x q process torus and the rank arithmetic of the Fox schedule.
//!
//! Everything here is a pure function of `(world_size, n, policy)`, so every
//! rank computes the same grid without talking to anyone.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the grid side is chosen when `n` is not a multiple of `isqrt(world_size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GridPolicy {
    /// Use the widest grid and zero-pad the matrices up to a multiple of q
    #[default]
    Pad,
    /// Use the widest grid whose side divides n, down to a single block
    Shrink,
    /// Use the widest grid and reject sizes it does not divide
    Strict,
}

impl GridPolicy {
    /// Small integer identifying the policy on the wire
    pub fn code(self) -> u8 {
        match self {
            GridPolicy::Pad => 0,
            GridPolicy::Shrink => 1,
            GridPolicy::Strict => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GridPolicy::Pad),
            1 => Some(GridPolicy::Shrink),
            2 => Some(GridPolicy::Strict),
            _ => None,
        }
    }
}

impl fmt::Display for GridPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GridPolicy::Pad => "pad",
            GridPolicy::Shrink => "shrink",
            GridPolicy::Strict => "strict",
        };
        f.write_str(name)
    }
}

impl FromStr for GridPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pad" => Ok(GridPolicy::Pad),
            "shrink" => Ok(GridPolicy::Shrink),
            "strict" => Ok(GridPolicy::Strict),
            other => Err(Error::ValidationError(format!(
                "Unknown grid policy '{}', expected pad, shrink or strict", other
            ))),
        }
    }
}

/// Part a rank plays in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridRole {
    /// Inside the grid at the given position
    Active { row: usize, col: usize },
    /// Outside the grid; takes no part after the grid is known
    Idle,
}

/// Immutable grid configuration shared by every component of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGrid {
    /// Grid side q
    q: usize,
    /// Logical matrix side
    n: usize,
    /// Matrix side after padding, a multiple of q
    padded_n: usize,
    /// Number of cooperating ranks
    world_size: usize,
    /// Policy the grid was derived with
    policy: GridPolicy,
}

impl ProcessGrid {
    /// Derive the grid for `world_size` ranks multiplying `n x n` matrices
    pub fn compute(world_size: usize, n: usize, policy: GridPolicy) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidGrid("world size must be at least 1".to_string()));
        }

        let widest = isqrt(world_size);

        let q = if n == 0 {
            1
        } else {
            match policy {
                GridPolicy::Pad => widest.min(n),
                GridPolicy::Shrink => (1..=widest).rev().find(|q| n % q == 0).unwrap_or(1),
                GridPolicy::Strict => {
                    if n % widest != 0 {
                        return Err(Error::InvalidGrid(format!(
                            "matrix side {} is not divisible by grid side {} ({} ranks)",
                            n, widest, world_size
                        )));
                    }
                    widest
                }
            }
        };

        let padded_n = (n + q - 1) / q * q;

        Ok(Self {
            q,
            n,
            padded_n,
            world_size,
            policy,
        })
    }

    /// Grid side q
    pub fn side(&self) -> usize {
        self.q
    }

    /// Logical matrix side n
    pub fn n(&self) -> usize {
        self.n
    }

    /// Matrix side the blocks are cut from
    pub fn padded_n(&self) -> usize {
        self.padded_n
    }

    /// Block side k
    pub fn block_size(&self) -> usize {
        self.padded_n / self.q
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn policy(&self) -> GridPolicy {
        self.policy
    }

    pub fn is_padded(&self) -> bool {
        self.padded_n != self.n
    }

    /// Number of ranks inside the grid
    pub fn active_count(&self) -> usize {
        self.q * self.q
    }

    pub fn idle_count(&self) -> usize {
        self.world_size - self.active_count()
    }

    pub fn is_active(&self, rank: usize) -> bool {
        rank < self.active_count()
    }

    pub fn role(&self, rank: usize) -> GridRole {
        match self.coords(rank) {
            Some((row, col)) => GridRole::Active { row, col },
            None => GridRole::Idle,
        }
    }

    /// Grid position of an active rank, row-major
    pub fn coords(&self, rank: usize) -> Option<(usize, usize)> {
        if self.is_active(rank) {
            Some((rank / self.q, rank % self.q))
        } else {
            None
        }
    }

    /// Like `coords`, for callers that require an active rank
    pub fn rank_coords(&self, rank: usize) -> Result<(usize, usize)> {
        self.coords(rank).ok_or_else(|| {
            Error::InvalidGrid(format!(
                "rank {} is outside the {}x{} grid", rank, self.q, self.q
            ))
        })
    }

    /// Rank at a grid position; coordinates wrap around the torus
    pub fn rank_of(&self, row: usize, col: usize) -> usize {
        (row % self.q) * self.q + (col % self.q)
    }

    /// Ranks of the active processes, in rank order
    pub fn active_ranks(&self) -> Vec<usize> {
        (0..self.active_count()).collect()
    }

    /// Ranks sharing a grid row, ordered by column
    pub fn row_members(&self, row: usize) -> Vec<usize> {
        (0..self.q).map(|col| self.rank_of(row, col)).collect()
    }

    /// Rank broadcasting the A block to `row` during `step`
    pub fn broadcaster(&self, row: usize, step: usize) -> usize {
        self.rank_of(row, broadcaster_col(row, step, self.q))
    }

    /// `(send_to, recv_from)` ranks of the B rotation for a grid position
    pub fn rotation_ranks(&self, row: usize, col: usize) -> (usize, usize) {
        let (up, down) = rotation_peers(row, col, self.q);
        (self.rank_of(up.0, up.1), self.rank_of(down.0, down.1))
    }
}

/// Column whose A block row `row` uses in round `step`
pub fn broadcaster_col(row: usize, step: usize, q: usize) -> usize {
    (row + step) % q
}

/// Grid positions `(send_to, recv_from)` for shifting B one step up a column
pub fn rotation_peers(row: usize, col: usize, q: usize) -> ((usize, usize), (usize, usize)) {
    let up = ((row + q - 1) % q, col);
    let down = ((row + 1) % q, col);
    (up, down)
}

/// Integer square root, rounded down
pub fn isqrt(x: usize) -> usize {
    if x < 2 {
        return x;
    }

    // Newton iteration from an upper bound; monotonically decreasing
    let mut r = x / 2 + 1;
    let mut next = (r + x / r) / 2;
    while next < r {
        r = next;
        next = (r + x / r) / 2;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isqrt() {
        let expected = [0, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3];
        for (x, &root) in expected.iter().enumerate() {
            assert_eq!(isqrt(x), root, "isqrt({})", x);
        }
        assert_eq!(isqrt(99), 9);
        assert_eq!(isqrt(100), 10);
        assert_eq!(isqrt(1 << 30), 1 << 15);
        assert_eq!(isqrt((1 << 30) - 1), (1 << 15) - 1);
    }

    #[test]
    fn test_grid_validity_all_policies() {
        for world_size in 1..=30 {
            for n in 0..=24 {
                for policy in [GridPolicy::Pad, GridPolicy::Shrink, GridPolicy::Strict] {
                    match ProcessGrid::compute(world_size, n, policy) {
                        Ok(grid) => {
                            let q = grid.side();
                            assert!(q >= 1);
                            assert!(q * q <= world_size);
                            assert_eq!(grid.padded_n() % q, 0);
                            assert!(grid.padded_n() >= n);
                            assert!(grid.padded_n() < n + q);
                            if policy != GridPolicy::Pad {
                                assert_eq!(n % q, 0);
                                assert!(!grid.is_padded());
                            }
                        }
                        Err(Error::InvalidGrid(_)) => {
                            assert_eq!(policy, GridPolicy::Strict);
                            assert_ne!(n % isqrt(world_size), 0);
                        }
                        Err(other) => panic!("unexpected error {}", other),
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_world_rejected() {
        assert!(matches!(
            ProcessGrid::compute(0, 4, GridPolicy::Pad),
            Err(Error::InvalidGrid(_))
        ));
    }

    #[test]
    fn test_pad_policy() {
        let grid = ProcessGrid::compute(4, 3, GridPolicy::Pad).unwrap();
        assert_eq!(grid.side(), 2);
        assert_eq!(grid.padded_n(), 4);
        assert_eq!(grid.block_size(), 2);
        assert!(grid.is_padded());

        // Never more grid columns than matrix columns
        let grid = ProcessGrid::compute(16, 2, GridPolicy::Pad).unwrap();
        assert_eq!(grid.side(), 2);
        assert_eq!(grid.block_size(), 1);
    }

    #[test]
    fn test_shrink_policy() {
        let grid = ProcessGrid::compute(9, 4, GridPolicy::Shrink).unwrap();
        assert_eq!(grid.side(), 2);
        assert_eq!(grid.block_size(), 2);

        let grid = ProcessGrid::compute(16, 7, GridPolicy::Shrink).unwrap();
        assert_eq!(grid.side(), 1);
        assert_eq!(grid.block_size(), 7);
    }

    #[test]
    fn test_strict_policy() {
        let grid = ProcessGrid::compute(9, 6, GridPolicy::Strict).unwrap();
        assert_eq!(grid.side(), 3);
        assert!(ProcessGrid::compute(9, 4, GridPolicy::Strict).is_err());
    }

    #[test]
    fn test_degenerate_sizes() {
        for policy in [GridPolicy::Pad, GridPolicy::Shrink, GridPolicy::Strict] {
            let grid = ProcessGrid::compute(9, 0, policy).unwrap();
            assert_eq!(grid.side(), 1);
            assert_eq!(grid.block_size(), 0);
        }

        let grid = ProcessGrid::compute(4, 1, GridPolicy::Pad).unwrap();
        assert_eq!(grid.side(), 1);
        assert_eq!(grid.block_size(), 1);
    }

    #[test]
    fn test_roles_and_idle_ranks() {
        let grid = ProcessGrid::compute(5, 4, GridPolicy::Pad).unwrap();
        assert_eq!(grid.side(), 2);
        assert_eq!(grid.idle_count(), 1);
        assert_eq!(grid.role(0), GridRole::Active { row: 0, col: 0 });
        assert_eq!(grid.role(3), GridRole::Active { row: 1, col: 1 });
        assert_eq!(grid.role(4), GridRole::Idle);
        assert_eq!(grid.coords(2), Some((1, 0)));
        assert_eq!(grid.active_ranks(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_row_members() {
        let grid = ProcessGrid::compute(9, 9, GridPolicy::Pad).unwrap();
        assert_eq!(grid.row_members(1), vec![3, 4, 5]);
        assert_eq!(grid.rank_of(4, 5), grid.rank_of(1, 2));
    }

    #[test]
    fn test_broadcaster_schedule_covers_each_row() {
        let q = 4;
        for row in 0..q {
            let mut cols: Vec<usize> = (0..q).map(|step| broadcaster_col(row, step, q)).collect();
            assert_eq!(cols[0], row);
            cols.sort_unstable();
            assert_eq!(cols, (0..q).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_rotation_peers_wrap() {
        assert_eq!(rotation_peers(0, 1, 3), ((2, 1), (1, 1)));
        assert_eq!(rotation_peers(2, 0, 3), ((1, 0), (0, 0)));
        assert_eq!(rotation_peers(0, 0, 1), ((0, 0), (0, 0)));

        let grid = ProcessGrid::compute(9, 3, GridPolicy::Pad).unwrap();
        assert_eq!(grid.rotation_ranks(0, 1), (7, 4));
        assert_eq!(grid.broadcaster(2, 2), grid.rank_of(2, 1));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("pad".parse::<GridPolicy>().unwrap(), GridPolicy::Pad);
        assert_eq!(" Strict ".parse::<GridPolicy>().unwrap(), GridPolicy::Strict);
        assert_eq!(GridPolicy::Shrink.to_string().parse::<GridPolicy>().unwrap(), GridPolicy::Shrink);
        for policy in [GridPolicy::Pad, GridPolicy::Shrink, GridPolicy::Strict] {
            assert_eq!(GridPolicy::from_code(policy.code()), Some(policy));
        }
        assert_eq!(GridPolicy::from_code(3), None);
        assert!("diagonal".parse::<GridPolicy>().is_err());
    }
}
