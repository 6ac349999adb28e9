//! Simulation data types.

use serde::{Deserialize, Serialize};

/// Grid coordinates as `(row, col)`.
pub type Position = (usize, usize);

/// Population group of a dynamic agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Resident,
    Immigrant,
}

/// Static agent: the house or land attached to one cell.
///
/// Every cell has exactly one site for the whole run. Only its quality changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pos: Position,
    is_center: bool,
    pub(crate) quality: f64,
}

impl Site {
    pub(crate) fn new(pos: Position, is_center: bool) -> Self {
        Self {
            pos,
            is_center,
            quality: 0.0,
        }
    }

    pub fn pos(&self) -> Position {
        self.pos
    }

    pub fn is_center(&self) -> bool {
        self.is_center
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }
}

/// Dynamic agent: a household that can relocate.
///
/// The position is only ever written by the grid, which keeps it in sync
/// with cell occupancy.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    kind: AgentKind,
    income: f64,
    homophily_preference: f64,
    sensitivity: f64,
    threshold: f64,
    pub(crate) pos: Position,
}

impl Agent {
    /// Create an agent. It gets its position when placed on a grid.
    pub fn new(
        kind: AgentKind,
        income: f64,
        homophily_preference: f64,
        sensitivity: f64,
        threshold: f64,
    ) -> Self {
        Self {
            kind,
            income,
            homophily_preference: homophily_preference.clamp(0.0, 1.0),
            sensitivity,
            threshold: threshold.clamp(0.0, 1.0),
            pos: (0, 0),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn income(&self) -> f64 {
        self.income
    }

    pub fn homophily_preference(&self) -> f64 {
        self.homophily_preference
    }

    pub fn travel_preference(&self) -> f64 {
        1.0 - self.homophily_preference
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn pos(&self) -> Position {
        self.pos
    }

    pub fn is_happy(&self, utility: f64) -> bool {
        utility >= self.threshold
    }

    /// Raise the threshold after a happy tick, lower it after an unhappy one.
    ///
    /// Rates are scaled by the agent's sensitivity; the threshold stays in `[0, 1]`.
    pub fn adapt_threshold(&mut self, happy: bool, delta_up: f64, delta_down: f64) {
        let threshold = if happy {
            self.threshold + delta_up * self.sensitivity
        } else {
            self.threshold - delta_down * self.sensitivity
        };
        self.threshold = threshold.clamp(0.0, 1.0);
    }
}

/// Simulation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Converged,
    MaxStepsReached,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        self != Status::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Converged => "converged",
            Status::MaxStepsReached => "max_steps_reached",
        }
    }
}

/// Read-only view of a dynamic agent at a tick boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupantView {
    pub id: usize,
    pub kind: AgentKind,
    pub income: f64,
    pub threshold: f64,
    pub utility: f64,
    pub happy: bool,
    /// Whether the agent relocated during the tick that produced the snapshot.
    pub moved: bool,
}

/// Read-only view of one cell at a tick boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellView {
    pub row: usize,
    pub col: usize,
    pub quality: f64,
    pub is_center: bool,
    pub occupant: Option<OccupantView>,
}

/// Full grid state handed to observers between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: usize,
    pub status: Status,
    pub width: usize,
    pub height: usize,
    pub cells: Vec<CellView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn travel_preference_complements_homophily() {
        let agent = Agent::new(AgentKind::Resident, 1.0, 0.7, 1.0, 0.5);
        assert!((agent.travel_preference() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn happy_agent_raises_threshold() {
        let mut agent = Agent::new(AgentKind::Resident, 1.0, 0.5, 1.0, 0.5);
        agent.adapt_threshold(true, 0.1, 0.2);
        assert!((agent.threshold() - 0.6).abs() < 1e-12);
        agent.adapt_threshold(false, 0.1, 0.2);
        assert!((agent.threshold() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn sensitivity_scales_adaptation() {
        let mut agent = Agent::new(AgentKind::Immigrant, 1.0, 0.5, 2.0, 0.5);
        agent.adapt_threshold(false, 0.0, 0.1);
        assert!((agent.threshold() - 0.3).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn threshold_stays_in_unit_interval(
            start in 0.0f64..=1.0,
            delta_up in 0.0f64..=1.0,
            delta_down in 0.0f64..=1.0,
            sensitivity in 0.0f64..=10.0,
            outcomes in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let mut agent = Agent::new(AgentKind::Resident, 1.0, 0.5, sensitivity, start);
            for happy in outcomes {
                agent.adapt_threshold(happy, delta_up, delta_down);
                prop_assert!((0.0..=1.0).contains(&agent.threshold()));
            }
        }
    }
}
