//! Cutting full matrices into grid blocks and moving them between the root
//! and the active ranks.

use ndarray::{s, Array2};

use crate::comm::{Communicator, Tag};
use crate::error::{Error, Result};
use crate::grid::ProcessGrid;
use crate::matrix::{self, Matrix};

/// The pair of blocks an active rank starts the rounds with
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBlocks {
    /// Block of A at this rank's grid position
    pub a: Matrix,
    /// Block of B at this rank's grid position
    pub b: Matrix,
}

/// What the root ends up with after a gather
#[derive(Debug, Clone, PartialEq)]
pub struct GatherOutcome {
    /// Padded `n' x n'` matrix with every received block in place
    pub matrix: Matrix,
    /// Grid position of each block written, in the order they were placed
    pub positions: Vec<(usize, usize)>,
}

impl GatherOutcome {
    /// Number of distinct grid positions written, the root's own included
    pub fn blocks_received(&self) -> usize {
        let mut seen = self.positions.clone();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}

/// Copy of the `k x k` block whose top-left corner is `(row * k, col * k)`
pub fn extract_block(full: &Matrix, row: usize, col: usize, k: usize) -> Matrix {
    full.slice(s![row * k..(row + 1) * k, col * k..(col + 1) * k]).to_owned()
}

/// Write `block` into `full` at grid position `(row, col)`
pub fn place_block(full: &mut Matrix, block: &Matrix, row: usize, col: usize) -> Result<()> {
    let (k, cols) = block.dim();
    if k != cols {
        return Err(Error::BlockSizeMismatch {
            expected: k * k,
            actual: k * cols,
        });
    }

    let (end_row, end_col) = ((row + 1) * k, (col + 1) * k);
    if end_row > full.nrows() || end_col > full.ncols() {
        return Err(Error::ValidationError(format!(
            "block ({}, {}) of side {} does not fit a {}x{} matrix",
            row, col, k, full.nrows(), full.ncols()
        )));
    }

    full.slice_mut(s![row * k..end_row, col * k..end_col]).assign(block);
    Ok(())
}

/// Rebuild a `k x k` block from a received buffer
pub fn block_from_vec(k: usize, data: Vec<f64>) -> Result<Matrix> {
    if data.len() != k * k {
        return Err(Error::BlockSizeMismatch {
            expected: k * k,
            actual: data.len(),
        });
    }
    Ok(Array2::from_shape_vec((k, k), data)?)
}

/// Moves blocks between the root and the active ranks of one grid
pub struct BlockDistributor<'a> {
    grid: &'a ProcessGrid,
    root: usize,
}

impl<'a> BlockDistributor<'a> {
    pub fn new(grid: &'a ProcessGrid, root: usize) -> Self {
        Self { grid, root }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Hand every active rank its block of `full`.
    ///
    /// Only the root passes the matrix. It is zero-padded to the grid's
    /// padded size before cutting. Active ranks get their own block back;
    /// idle ranks get `None` and exchange nothing.
    pub fn scatter<C: Communicator>(&self, comm: &C, full: Option<&Matrix>, tag: Tag) -> Result<Option<Matrix>> {
        let rank = comm.rank();
        if !self.grid.is_active(rank) {
            return Ok(None);
        }

        let k = self.grid.block_size();
        if rank != self.root {
            let data = comm.recv(self.root, tag)?;
            return block_from_vec(k, data).map(Some);
        }

        let full = full.ok_or_else(|| {
            Error::ValidationError(format!("root rank {} has no matrix to scatter", rank))
        })?;
        let padded_n = self.grid.padded_n();
        if full.dim() != (self.grid.n(), self.grid.n()) {
            return Err(Error::ValidationError(format!(
                "scatter expects a {}x{} matrix, got {}x{}",
                self.grid.n(), self.grid.n(), full.nrows(), full.ncols()
            )));
        }
        let padded = matrix::pad_to(full, padded_n);

        let mut own = None;
        for dest in self.grid.active_ranks() {
            let (row, col) = self.grid.rank_coords(dest)?;
            let block = extract_block(&padded, row, col, k);
            if dest == rank {
                own = Some(block);
            } else {
                comm.send(dest, tag, matrix::to_row_major(&block))?;
            }
        }

        log::debug!("root {} scattered {:?}: {} blocks of {}x{}", rank, tag, self.grid.active_count(), k, k);
        Ok(own)
    }

    /// Scatter A and B; active ranks end with exactly one block of each
    pub fn scatter_pair<C: Communicator>(
        &self,
        comm: &C,
        a: Option<&Matrix>,
        b: Option<&Matrix>,
    ) -> Result<Option<LocalBlocks>> {
        let a = self.scatter(comm, a, Tag::ScatterA)?;
        let b = self.scatter(comm, b, Tag::ScatterB)?;

        match (a, b) {
            (Some(a), Some(b)) => Ok(Some(LocalBlocks { a, b })),
            (None, None) => Ok(None),
            _ => Err(Error::CommunicationError {
                rank: comm.rank(),
                message: "received only one of the A and B blocks".to_string(),
            }),
        }
    }

    /// Collect one block per active rank at the root.
    ///
    /// Non-root ranks send their block and get `None`. Idle ranks must not
    /// call this with a block; they return `None` without communicating.
    pub fn gather<C: Communicator>(&self, comm: &C, local: Option<&Matrix>) -> Result<Option<GatherOutcome>> {
        let rank = comm.rank();
        if !self.grid.is_active(rank) {
            return Ok(None);
        }

        let k = self.grid.block_size();
        let local = local.ok_or_else(|| Error::CommunicationError {
            rank,
            message: "active rank has no block to gather".to_string(),
        })?;
        if local.dim() != (k, k) {
            return Err(Error::BlockSizeMismatch {
                expected: k * k,
                actual: local.len(),
            });
        }

        if rank != self.root {
            comm.send(self.root, Tag::Gather, matrix::to_row_major(local))?;
            return Ok(None);
        }

        let padded_n = self.grid.padded_n();
        let mut full = Array2::zeros((padded_n, padded_n));
        let mut positions = Vec::with_capacity(self.grid.active_count());
        for source in self.grid.active_ranks() {
            let (row, col) = self.grid.rank_coords(source)?;
            if source == rank {
                place_block(&mut full, local, row, col)?;
            } else {
                let block = block_from_vec(k, comm.recv(source, Tag::Gather)?)?;
                place_block(&mut full, &block, row, col)?;
            }
            positions.push((row, col));
        }

        log::debug!("root {} gathered {} blocks of {}x{}", rank, positions.len(), k, k);
        Ok(Some(GatherOutcome {
            matrix: full,
            positions,
        }))
    }
}
