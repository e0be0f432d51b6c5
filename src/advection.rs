//! Annealing schedule of one bundling phase
//!
//! The bandwidth decays geometrically with every iteration; the phase is done
//! once it drops below the configured limit.

use crate::config::AnnealingConfig;

/// Sweep direction of an advection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    /// Sign applied to the advection step
    pub fn sign(self) -> f32 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Progress of one annealing phase
#[derive(Debug, Clone, PartialEq)]
pub struct AdvectionProgress {
    iteration: u32,
    initial_bandwidth: f32,
    bandwidth: f32,
    reduction: f32,
    limit: f32,
    direction: Direction,
    similarity: f32,
    limit_reached: bool,
}

impl AdvectionProgress {
    /// Create a schedule at iteration 0. The config is expected to be
    /// validated (`0 < reduction < 1`, `limit < bandwidth`).
    pub fn new(config: &AnnealingConfig, direction: Direction) -> Self {
        Self {
            iteration: 0,
            initial_bandwidth: config.bandwidth,
            bandwidth: config.bandwidth,
            reduction: config.reduction,
            limit: config.limit,
            direction,
            similarity: 0.0,
            limit_reached: false,
        }
    }

    /// Restart the phase
    pub fn reset(&mut self) {
        self.iteration = 0;
        self.bandwidth = self.initial_bandwidth;
        self.similarity = 0.0;
        self.limit_reached = false;
    }

    /// Restart the phase sweeping in `direction`
    pub fn reset_with(&mut self, direction: Direction) {
        self.direction = direction;
        self.reset();
    }

    /// Advance one iteration. Does nothing once the limit is reached.
    pub fn iterate(&mut self) {
        if self.limit_reached {
            return;
        }
        self.iteration += 1;
        self.bandwidth = self.initial_bandwidth * self.bandwidth_reduction();
        let span = self.initial_bandwidth - self.limit;
        let progress = if span > 0.0 {
            1.0 - (self.bandwidth - self.limit) / span
        } else {
            1.0
        };
        self.similarity = (0.9 * progress).max(0.0).sqrt().min(1.0);
        self.limit_reached = self.bandwidth < self.limit;
    }

    /// `reduction ^ iteration`
    pub fn bandwidth_reduction(&self) -> f32 {
        self.reduction.powi(self.iteration as i32)
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn bandwidth(&self) -> f32 {
        self.bandwidth
    }

    pub fn limit(&self) -> f32 {
        self.limit
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn similarity(&self) -> f32 {
        self.similarity
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached
    }
}
