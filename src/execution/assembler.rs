use crate::comm::Communicator;
use crate::distribution::{BlockDistributor, GatherOutcome};
use crate::error::{Error, Result};
use crate::grid::ProcessGrid;
use crate::matrix::{self, Matrix};

/// Collects the accumulated C blocks into the dense result at the root
pub struct ResultAssembler<'a> {
    grid: &'a ProcessGrid,
    distributor: BlockDistributor<'a>,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(grid: &'a ProcessGrid, root: usize) -> Self {
        Self {
            grid,
            distributor: BlockDistributor::new(grid, root),
        }
    }

    /// Gather every active rank's C block and rebuild the `n x n` product.
    ///
    /// Only the root gets `Some`. Idle ranks take no part and must pass `None`;
    /// active ranks must pass their block. Padding rows and columns are cut
    /// off before the result is returned.
    pub fn assemble<C: Communicator>(&self, comm: &C, local_c: Option<&Matrix>) -> Result<Option<Matrix>> {
        let rank = comm.rank();
        if !self.grid.is_active(rank) {
            if local_c.is_some() {
                log::warn!("idle rank {} offered a block; it is ignored", rank);
            }
            return Ok(None);
        }

        let outcome = match self.distributor.gather(comm, local_c)? {
            Some(outcome) => outcome,
            None => return Ok(None),
        };

        self.check_coverage(&outcome)?;
        Ok(Some(matrix::truncate_to(outcome.matrix, self.grid.n())))
    }

    /// Every grid position must have been written exactly once
    fn check_coverage(&self, outcome: &GatherOutcome) -> Result<()> {
        let q = self.grid.side();
        if let Some(&(row, col)) = outcome.positions.iter().find(|&&(row, col)| row >= q || col >= q) {
            return Err(Error::ValidationError(format!(
                "gathered block at ({}, {}) lies outside a grid of side {}", row, col, q
            )));
        }

        let distinct = outcome.blocks_received();
        if distinct != q * q || outcome.positions.len() != q * q {
            return Err(Error::ValidationError(format!(
                "gathered {} blocks covering {} positions, grid of side {} needs {}",
                outcome.positions.len(),
                distinct,
                q,
                q * q
            )));
        }
        Ok(())
    }
}
