//! Annealing schedule for the per-iteration step length

use crate::config::LayoutConfig;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cooling factor fell below the minimum
    Converged,
    /// The iteration budget was used up
    BudgetExhausted,
    /// A stop was requested through a [`crate::driver::StopHandle`]
    Requested,
}

/// Cooling factor after `k` iterations is `initial * decay^k`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoolingSchedule {
    pub initial: f32,
    pub decay: f32,
    pub min: f32,
    pub budget: u32,
}

impl CoolingSchedule {
    pub fn from_config(config: &LayoutConfig) -> Self {
        Self {
            initial: config.initial_cooling,
            decay: config.cooling_decay,
            min: config.min_cooling,
            budget: config.iteration_budget,
        }
    }

    /// Cooling factor in effect for iteration `k` (after `k` completed iterations)
    pub fn factor(&self, k: u32) -> f32 {
        self.initial * self.decay.powi(k as i32)
    }

    /// Whether a run that has completed `k` iterations must stop
    pub fn termination(&self, k: u32) -> Option<StopReason> {
        if self.factor(k) < self.min {
            Some(StopReason::Converged)
        } else if k >= self.budget {
            Some(StopReason::BudgetExhausted)
        } else {
            None
        }
    }

    /// Number of iterations a run performs when never interrupted
    pub fn planned_iterations(&self) -> u32 {
        (0..=self.budget)
            .find(|&k| self.termination(k).is_some())
            .unwrap_or(self.budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_decays_geometrically() {
        let schedule = CoolingSchedule::from_config(&LayoutConfig::default());
        assert_eq!(schedule.factor(0), 0.985);
        for k in [1, 10, 100] {
            let expected = 0.985f32 * 0.975f32.powi(k as i32);
            assert!((schedule.factor(k) - expected).abs() < 1e-9);
        }
        for k in 0..200 {
            assert!(schedule.factor(k + 1) < schedule.factor(k));
        }
    }

    #[test]
    fn default_run_converges_before_budget() {
        let schedule = CoolingSchedule::from_config(&LayoutConfig::default());
        let k = schedule.planned_iterations();
        assert_eq!(k, 364);
        assert!(schedule.factor(k) < 0.0001);
        assert!(schedule.factor(k - 1) >= 0.0001);
        assert_eq!(schedule.termination(k), Some(StopReason::Converged));
        assert_eq!(schedule.termination(k - 1), None);
    }

    #[test]
    fn budget_caps_the_run() {
        let schedule = CoolingSchedule {
            budget: 50,
            ..CoolingSchedule::from_config(&LayoutConfig::default())
        };
        assert_eq!(schedule.planned_iterations(), 50);
        assert_eq!(schedule.termination(50), Some(StopReason::BudgetExhausted));
    }

    #[test]
    fn zero_budget_runs_nothing() {
        let schedule = CoolingSchedule {
            budget: 0,
            ..CoolingSchedule::from_config(&LayoutConfig::default())
        };
        assert_eq!(schedule.planned_iterations(), 0);
    }
}
