//! Learning rate scheduling.
//!
//! Schedules advance once per optimizer update, not per epoch:
//! - Constant
//! - Inverse-time decay, `lr / (1 + decay * iterations)`

use finetune_core::OptimizerConfig;
use serde::{Deserialize, Serialize};

/// Learning rate scheduler type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate (no scheduling)
    #[default]
    Constant,

    /// Divide the base rate by `1 + decay * iterations`
    InverseTimeDecay { decay: f64 },
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_lr: f64,
    iterations: u64,
}

impl LearningRateScheduler {
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_lr: base_lr,
            iterations: 0,
        }
    }

    /// Schedule matching an optimizer's configured rate and decay
    pub fn for_optimizer(optimizer: &OptimizerConfig) -> Self {
        let decay = optimizer.decay();
        let scheduler_type = if decay > 0.0 {
            SchedulerType::InverseTimeDecay { decay }
        } else {
            SchedulerType::Constant
        };
        Self::new(scheduler_type, optimizer.learning_rate())
    }

    /// Rate for the next update
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Records one optimizer update.
    pub fn step(&mut self) {
        self.iterations += 1;

        match self.scheduler_type {
            SchedulerType::Constant => {}
            SchedulerType::InverseTimeDecay { decay } => {
                self.current_lr = self.base_lr / (1.0 + decay * self.iterations as f64);
            }
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}
