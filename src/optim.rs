use std::fmt;

use burn::optim::{momentum::MomentumConfig, AdamConfig, SgdConfig};
use serde::{Deserialize, Serialize};

/// Momentum coefficient of the SGD rule.
pub const SGD_MOMENTUM: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateRule {
    Adam,
    Sgd,
}

/// The update rule together with its hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizerSettings {
    Adam { learning_rate: f64 },
    Sgd { learning_rate: f64, momentum: f64 },
}

impl OptimizerSettings {
    pub fn new(rule: UpdateRule, learning_rate: f64) -> Self {
        match rule {
            UpdateRule::Adam => OptimizerSettings::Adam { learning_rate },
            UpdateRule::Sgd => OptimizerSettings::Sgd {
                learning_rate,
                momentum: SGD_MOMENTUM,
            },
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerSettings::Adam { learning_rate }
            | OptimizerSettings::Sgd { learning_rate, .. } => *learning_rate,
        }
    }

    pub fn adam_config() -> AdamConfig {
        AdamConfig::new()
    }

    /// Plain heavy-ball momentum: no dampening, no Nesterov step.
    pub fn sgd_config(momentum: f64) -> SgdConfig {
        SgdConfig::new().with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(momentum)
                .with_dampening(0.0)
                .with_nesterov(false),
        ))
    }
}

impl fmt::Display for OptimizerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerSettings::Adam { learning_rate } => {
                write!(f, "Adam (learning rate {learning_rate})")
            }
            OptimizerSettings::Sgd {
                learning_rate,
                momentum,
            } => write!(
                f,
                "SGD (learning rate {learning_rate}, momentum {momentum})"
            ),
        }
    }
}
