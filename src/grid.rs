//! Bounded city lattice.
//!
//! The grid owns every site and every dynamic agent. Agents are addressed by
//! their index in the agent list; cells store the index of their occupant.
//! Occupancy only changes through [`Grid::place`] and [`Grid::relocate`].

use crate::error::SimError;
use crate::model::{Agent, Position, Site};

#[derive(Debug, Clone)]
struct Cell {
    site: Site,
    occupant: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Grid {
    width: usize,
    height: usize,
    center: Position,
    max_distance: usize,
    cells: Vec<Cell>,
    agents: Vec<Agent>,
    quality_smoothing: f64,
    income_scale: f64,
}

impl Grid {
    /// Create an empty grid with the city center at `center`.
    pub fn new(
        width: usize,
        height: usize,
        center: Position,
        quality_smoothing: f64,
        income_scale: f64,
    ) -> Result<Self, SimError> {
        if width == 0 || height == 0 {
            return Err(SimError::config("grid", "dimensions must be positive"));
        }
        if center.0 >= height || center.1 >= width {
            return Err(SimError::OutOfBounds {
                row: center.0,
                col: center.1,
            });
        }

        let mut cells = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                cells.push(Cell {
                    site: Site::new((row, col), (row, col) == center),
                    occupant: None,
                });
            }
        }

        // Farthest cell from the center is always a corner.
        let max_distance =
            center.0.max(height - 1 - center.0) + center.1.max(width - 1 - center.1);

        Ok(Self {
            width,
            height,
            center,
            max_distance,
            cells,
            agents: Vec::new(),
            quality_smoothing,
            income_scale,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn center(&self) -> Position {
        self.center
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.0 < self.height && pos.1 < self.width
    }

    fn index(&self, pos: Position) -> Result<usize, SimError> {
        if !self.in_bounds(pos) {
            return Err(SimError::OutOfBounds {
                row: pos.0,
                col: pos.1,
            });
        }
        Ok(pos.0 * self.width + pos.1)
    }

    pub fn site(&self, pos: Position) -> Result<&Site, SimError> {
        let idx = self.index(pos)?;
        Ok(&self.cells[idx].site)
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.cells.iter().map(|cell| &cell.site)
    }

    /// Index of the agent living at `pos`, if any.
    pub fn occupant_id(&self, pos: Position) -> Result<Option<usize>, SimError> {
        let idx = self.index(pos)?;
        Ok(self.cells[idx].occupant)
    }

    pub fn agent(&self, id: usize) -> Result<&Agent, SimError> {
        self.agents.get(id).ok_or(SimError::UnknownAgent(id))
    }

    pub(crate) fn agent_mut(&mut self, id: usize) -> Result<&mut Agent, SimError> {
        self.agents.get_mut(id).ok_or(SimError::UnknownAgent(id))
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Moore neighbourhood of `pos` within `radius`, clipped at the edges.
    ///
    /// The cell itself is not included.
    pub fn neighbors(&self, pos: Position, radius: usize) -> Result<Vec<Position>, SimError> {
        self.index(pos)?;
        Ok(self.block(pos, radius))
    }

    /// Neighbourhood of an in-bounds position.
    fn block(&self, pos: Position, radius: usize) -> Vec<Position> {
        let row_lo = pos.0.saturating_sub(radius);
        let row_hi = (pos.0 + radius).min(self.height - 1);
        let col_lo = pos.1.saturating_sub(radius);
        let col_hi = (pos.1 + radius).min(self.width - 1);

        let mut out = Vec::with_capacity((row_hi - row_lo + 1) * (col_hi - col_lo + 1));
        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                if (row, col) != pos {
                    out.push((row, col));
                }
            }
        }
        out
    }

    /// Unoccupied cells in row-major order.
    pub fn vacant_cells(&self) -> Vec<Position> {
        self.cells
            .iter()
            .filter(|cell| cell.occupant.is_none())
            .map(|cell| cell.site.pos())
            .collect()
    }

    /// Manhattan distance to the center, normalized to `[0, 1]` by the
    /// largest distance on this grid.
    pub fn travel_time(&self, pos: Position) -> Result<f64, SimError> {
        self.index(pos)?;
        if self.max_distance == 0 {
            return Ok(0.0);
        }
        let distance = pos.0.abs_diff(self.center.0) + pos.1.abs_diff(self.center.1);
        Ok(distance as f64 / self.max_distance as f64)
    }

    /// Put a new agent into an empty cell and return its id.
    pub fn place(&mut self, mut agent: Agent, pos: Position) -> Result<usize, SimError> {
        let idx = self.index(pos)?;
        if self.cells[idx].occupant.is_some() {
            return Err(SimError::OccupancyConflict {
                row: pos.0,
                col: pos.1,
            });
        }

        let id = self.agents.len();
        agent.pos = pos;
        self.agents.push(agent);
        self.cells[idx].occupant = Some(id);
        self.refresh_quality(idx);
        Ok(id)
    }

    /// Move an agent to an empty cell.
    ///
    /// The target is checked before anything changes, so a failed move leaves
    /// the grid untouched.
    pub fn relocate(&mut self, id: usize, to: Position) -> Result<(), SimError> {
        let from = self.agent(id)?.pos();
        let from_idx = self.index(from)?;
        let to_idx = self.index(to)?;
        if self.cells[to_idx].occupant.is_some() {
            return Err(SimError::OccupancyConflict {
                row: to.0,
                col: to.1,
            });
        }
        debug_assert_eq!(self.cells[from_idx].occupant, Some(id));

        self.cells[from_idx].occupant = None;
        self.cells[to_idx].occupant = Some(id);
        self.agents[id].pos = to;

        self.refresh_quality(from_idx);
        self.refresh_quality(to_idx);
        Ok(())
    }

    /// Set every site's quality straight to its income signal.
    pub fn reset_quality(&mut self) {
        let signals: Vec<f64> = (0..self.cells.len())
            .map(|idx| self.income_signal(idx))
            .collect();
        for (cell, signal) in self.cells.iter_mut().zip(signals) {
            cell.site.quality = signal;
        }
    }

    /// Move every site's quality one smoothing step towards its income signal.
    pub fn refresh_all_quality(&mut self) {
        let signals: Vec<f64> = (0..self.cells.len())
            .map(|idx| self.income_signal(idx))
            .collect();
        let alpha = self.quality_smoothing;
        for (cell, signal) in self.cells.iter_mut().zip(signals) {
            cell.site.quality += alpha * (signal - cell.site.quality);
        }
    }

    fn refresh_quality(&mut self, idx: usize) {
        let signal = self.income_signal(idx);
        let site = &mut self.cells[idx].site;
        site.quality += self.quality_smoothing * (signal - site.quality);
    }

    /// Mean scaled income of the occupants of the radius-1 block around a
    /// cell, the cell included. Zero for an empty block.
    fn income_signal(&self, idx: usize) -> f64 {
        let pos = self.cells[idx].site.pos();
        let (sum, count) = self
            .block(pos, 1)
            .into_iter()
            .chain(std::iter::once(pos))
            .filter_map(|p| self.cells[p.0 * self.width + p.1].occupant)
            .fold((0.0, 0usize), |(sum, count), id| {
                (sum + self.agents[id].income(), count + 1)
            });
        if count == 0 {
            return 0.0;
        }
        sum / count as f64 / self.income_scale
    }

    /// Count `(same kind, occupied)` cells around `pos` as seen by agent `id`,
    /// which is skipped if it lies in the neighbourhood.
    pub fn neighbor_counts(
        &self,
        id: usize,
        pos: Position,
        radius: usize,
    ) -> Result<(usize, usize), SimError> {
        let kind = self.agent(id)?.kind();
        let mut same = 0;
        let mut occupied = 0;
        for p in self.neighbors(pos, radius)? {
            match self.cells[p.0 * self.width + p.1].occupant {
                Some(other) if other != id => {
                    occupied += 1;
                    if self.agents[other].kind() == kind {
                        same += 1;
                    }
                }
                _ => {}
            }
        }
        Ok((same, occupied))
    }

    /// Check that agents and cells agree on who lives where.
    pub fn check_occupancy(&self) -> bool {
        let occupied = self.cells.iter().filter(|cell| cell.occupant.is_some()).count();
        occupied == self.agents.len()
            && self.agents.iter().enumerate().all(|(id, agent)| {
                self.index(agent.pos())
                    .map(|idx| self.cells[idx].occupant == Some(id))
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentKind;

    fn agent(kind: AgentKind, income: f64) -> Agent {
        Agent::new(kind, income, 1.0, 1.0, 0.5)
    }

    #[test]
    fn neighbors_are_clipped_at_edges() {
        let grid = Grid::new(4, 4, (0, 0), 0.1, 1.0).unwrap();
        assert_eq!(grid.neighbors((0, 0), 1).unwrap().len(), 3);
        assert_eq!(grid.neighbors((1, 1), 1).unwrap().len(), 8);
        assert_eq!(grid.neighbors((0, 0), 2).unwrap().len(), 8);
        assert_eq!(grid.neighbors((3, 3), 10).unwrap().len(), 15);
        assert!(!grid.neighbors((2, 2), 1).unwrap().contains(&(2, 2)));
    }

    #[test]
    fn queries_outside_the_grid_are_rejected() {
        let mut grid = Grid::new(4, 4, (0, 0), 0.1, 1.0).unwrap();
        let id = grid.place(agent(AgentKind::Resident, 1.0), (1, 1)).unwrap();
        let err = SimError::OutOfBounds { row: 10, col: 0 };
        assert_eq!(grid.neighbors((10, 0), 1).unwrap_err(), err);
        assert_eq!(grid.travel_time((10, 0)).unwrap_err(), err);
        assert_eq!(grid.neighbor_counts(id, (10, 0), 1).unwrap_err(), err);
        assert_eq!(
            grid.neighbor_counts(id, (0, 4), 1).unwrap_err(),
            SimError::OutOfBounds { row: 0, col: 4 }
        );
    }

    #[test]
    fn travel_time_is_normalized() {
        let grid = Grid::new(5, 3, (1, 2), 0.1, 1.0).unwrap();
        assert_eq!(grid.travel_time((1, 2)).unwrap(), 0.0);
        assert_eq!(grid.travel_time((0, 0)).unwrap(), 1.0);
        assert_eq!(grid.travel_time((2, 4)).unwrap(), 1.0);
        assert!((grid.travel_time((1, 3)).unwrap() - 1.0 / 3.0).abs() < 1e-12);

        let single = Grid::new(1, 1, (0, 0), 0.1, 1.0).unwrap();
        assert_eq!(single.travel_time((0, 0)).unwrap(), 0.0);
    }

    #[test]
    fn center_is_flagged_once() {
        let grid = Grid::new(6, 4, (2, 3), 0.1, 1.0).unwrap();
        let centers: Vec<_> = grid.sites().filter(|site| site.is_center()).collect();
        assert_eq!(centers.len(), 1);
        assert_eq!(centers[0].pos(), (2, 3));
    }

    #[test]
    fn center_out_of_bounds_is_rejected() {
        assert!(Grid::new(4, 4, (4, 0), 0.1, 1.0).is_err());
    }

    #[test]
    fn place_rejects_occupied_cell() {
        let mut grid = Grid::new(3, 3, (1, 1), 0.1, 1.0).unwrap();
        grid.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        let err = grid.place(agent(AgentKind::Immigrant, 1.0), (0, 0)).unwrap_err();
        assert_eq!(err, SimError::OccupancyConflict { row: 0, col: 0 });
        assert_eq!(grid.agents().len(), 1);
    }

    #[test]
    fn relocate_moves_occupancy_atomically() {
        let mut grid = Grid::new(3, 3, (1, 1), 0.1, 1.0).unwrap();
        let a = grid.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        let b = grid.place(agent(AgentKind::Resident, 1.0), (2, 2)).unwrap();

        let err = grid.relocate(a, (2, 2)).unwrap_err();
        assert_eq!(err, SimError::OccupancyConflict { row: 2, col: 2 });
        assert_eq!(grid.agent(a).unwrap().pos(), (0, 0));
        assert!(grid.check_occupancy());

        grid.relocate(a, (1, 0)).unwrap();
        assert_eq!(grid.agent(a).unwrap().pos(), (1, 0));
        assert_eq!(grid.occupant_id((1, 0)).unwrap(), Some(a));
        assert_eq!(grid.occupant_id((0, 0)).unwrap(), None);
        assert_eq!(grid.occupant_id((2, 2)).unwrap(), Some(b));
        assert!(grid.check_occupancy());
        assert_eq!(grid.vacant_cells().len(), 7);
    }

    #[test]
    fn neighbor_counts_skip_the_agent_itself() {
        let mut grid = Grid::new(3, 3, (1, 1), 0.1, 1.0).unwrap();
        let a = grid.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        grid.place(agent(AgentKind::Resident, 1.0), (0, 1)).unwrap();
        grid.place(agent(AgentKind::Immigrant, 1.0), (1, 1)).unwrap();

        assert_eq!(grid.neighbor_counts(a, (0, 0), 1).unwrap(), (1, 2));
        // Evaluated from (1, 0), the agent's own cell at (0, 0) is not counted.
        assert_eq!(grid.neighbor_counts(a, (1, 0), 1).unwrap(), (1, 2));
    }

    #[test]
    fn quality_follows_occupant_income() {
        let mut grid = Grid::new(5, 5, (2, 2), 0.5, 100.0).unwrap();
        let a = grid.place(agent(AgentKind::Resident, 200.0), (0, 0)).unwrap();
        // Signal at (0, 0) is 2.0; one smoothing step from 0.0.
        assert!((grid.site((0, 0)).unwrap().quality() - 1.0).abs() < 1e-12);

        grid.relocate(a, (4, 4)).unwrap();
        assert!((grid.site((0, 0)).unwrap().quality() - 0.5).abs() < 1e-12);
        assert!((grid.site((4, 4)).unwrap().quality() - 1.0).abs() < 1e-12);

        grid.reset_quality();
        assert_eq!(grid.site((0, 0)).unwrap().quality(), 0.0);
        assert!((grid.site((3, 3)).unwrap().quality() - 2.0).abs() < 1e-12);
    }
}
