use crate::error::SimError;
use crate::grid::Grid;
use crate::model::Position;

/// Scores how desirable a cell is for a given agent.
///
/// `utility = w * homophily + (1 - w) * (1 - travel_time)`, where `w` is the
/// agent's homophily preference. With `w = 1` this is the plain Schelling rule.
#[derive(Debug, Clone, Copy)]
pub struct UtilityEngine {
    radius: usize,
}

impl UtilityEngine {
    pub fn new(radius: usize) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Fraction of same-type agents among the occupied neighbours of `pos`.
    ///
    /// An empty neighbourhood counts as fully similar.
    pub fn homophily(&self, grid: &Grid, id: usize, pos: Position) -> Result<f64, SimError> {
        let (same, occupied) = grid.neighbor_counts(id, pos, self.radius)?;
        if occupied == 0 {
            return Ok(1.0);
        }
        Ok(same as f64 / occupied as f64)
    }

    /// Utility of `pos` for agent `id`, in `[0, 1]`.
    pub fn utility(&self, grid: &Grid, id: usize, pos: Position) -> Result<f64, SimError> {
        let agent = grid.agent(id)?;
        let weight = agent.homophily_preference();

        let homophily = self.homophily(grid, id, pos)?;
        if weight >= 1.0 {
            return Ok(homophily);
        }
        let travel = 1.0 - grid.travel_time(pos)?;

        Ok((weight * homophily + agent.travel_preference() * travel).clamp(0.0, 1.0))
    }

    /// Utility of the agent's current cell.
    pub fn current(&self, grid: &Grid, id: usize) -> Result<f64, SimError> {
        let pos = grid.agent(id)?.pos();
        self.utility(grid, id, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, AgentKind};
    use proptest::prelude::*;

    fn agent(kind: AgentKind, weight: f64) -> Agent {
        Agent::new(kind, 1.0, weight, 1.0, 0.5)
    }

    #[test]
    fn isolated_agent_gets_full_homophily() {
        let mut grid = Grid::new(4, 4, (0, 0), 0.1, 1.0).unwrap();
        let id = grid.place(agent(AgentKind::Resident, 1.0), (2, 2)).unwrap();
        let engine = UtilityEngine::new(1);
        assert_eq!(engine.homophily(&grid, id, (2, 2)).unwrap(), 1.0);
        assert_eq!(engine.current(&grid, id).unwrap(), 1.0);
    }

    #[test]
    fn mixed_neighbourhood_scores_fraction() {
        let mut grid = Grid::new(4, 4, (0, 0), 0.1, 1.0).unwrap();
        let id = grid.place(agent(AgentKind::Resident, 1.0), (1, 1)).unwrap();
        grid.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        grid.place(agent(AgentKind::Immigrant, 1.0), (0, 1)).unwrap();
        grid.place(agent(AgentKind::Immigrant, 1.0), (2, 2)).unwrap();
        grid.place(agent(AgentKind::Immigrant, 1.0), (3, 3)).unwrap();

        let engine = UtilityEngine::new(1);
        assert!((engine.current(&grid, id).unwrap() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn travel_term_prefers_the_center() {
        let mut grid = Grid::new(5, 5, (2, 2), 0.1, 1.0).unwrap();
        let id = grid.place(agent(AgentKind::Resident, 0.0), (0, 0)).unwrap();
        let engine = UtilityEngine::new(1);
        assert_eq!(engine.utility(&grid, id, (2, 2)).unwrap(), 1.0);
        assert_eq!(engine.utility(&grid, id, (0, 0)).unwrap(), 0.0);
        assert!((engine.utility(&grid, id, (1, 2)).unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn full_homophily_weight_ignores_travel() {
        let mut near = Grid::new(5, 5, (0, 0), 0.1, 1.0).unwrap();
        let mut far = Grid::new(5, 5, (4, 4), 0.1, 1.0).unwrap();
        let a = near.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        let b = far.place(agent(AgentKind::Resident, 1.0), (0, 0)).unwrap();
        near.place(agent(AgentKind::Immigrant, 1.0), (0, 1)).unwrap();
        far.place(agent(AgentKind::Immigrant, 1.0), (0, 1)).unwrap();

        let engine = UtilityEngine::new(1);
        for pos in [(0, 0), (2, 2), (4, 4), (1, 1)] {
            assert_eq!(
                engine.utility(&near, a, pos).unwrap(),
                engine.utility(&far, b, pos).unwrap()
            );
        }
    }

    #[test]
    fn cell_outside_the_grid_is_an_error() {
        let mut grid = Grid::new(4, 4, (0, 0), 0.1, 1.0).unwrap();
        let id = grid.place(agent(AgentKind::Resident, 0.5), (1, 1)).unwrap();
        let engine = UtilityEngine::new(1);
        assert_eq!(
            engine.utility(&grid, id, (10, 0)).unwrap_err(),
            SimError::OutOfBounds { row: 10, col: 0 }
        );
        assert!(engine.homophily(&grid, id, (0, 7)).is_err());
    }

    proptest! {
        #[test]
        fn utility_is_bounded(
            weight in 0.0f64..=1.0,
            radius in 1usize..4,
            layout in proptest::collection::vec(0u8..3, 36),
            probe_row in 0usize..6,
            probe_col in 0usize..6,
        ) {
            let mut grid = Grid::new(6, 6, (1, 4), 0.1, 1.0).unwrap();
            let mut ids = Vec::new();
            for (idx, cell) in layout.iter().enumerate() {
                let kind = match cell {
                    0 => continue,
                    1 => AgentKind::Resident,
                    _ => AgentKind::Immigrant,
                };
                ids.push(grid.place(agent(kind, weight), (idx / 6, idx % 6)).unwrap());
            }
            let engine = UtilityEngine::new(radius);
            for id in ids {
                let value = engine.utility(&grid, id, (probe_row, probe_col)).unwrap();
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }
    }
}
