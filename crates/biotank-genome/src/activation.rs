//! Named activation functions applied by runtime neurons.

use serde::{Deserialize, Serialize};

/// Activation families a neuron gene may carry. The function is part of the
/// gene, never hardcoded per neuron layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActivationKind {
    /// Pass-through; useful for sensors and for deterministic fixtures.
    #[default]
    Identity,
    /// Logistic sigmoid squashing into (0, 1).
    Logistic,
    /// Hyperbolic tangent squashing into (-1, 1).
    Tanh,
}

impl ActivationKind {
    /// Apply the activation to a pre-activation sum.
    #[must_use]
    pub fn apply(self, value: f32) -> f32 {
        match self {
            Self::Identity => value,
            Self::Logistic => 1.0 / (1.0 + (-value).exp()),
            Self::Tanh => value.tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_values_through() {
        assert_eq!(ActivationKind::Identity.apply(-3.5), -3.5);
    }

    #[test]
    fn logistic_is_bounded_and_centered() {
        let mid = ActivationKind::Logistic.apply(0.0);
        assert!((mid - 0.5).abs() < 1e-6);
        assert!(ActivationKind::Logistic.apply(20.0) > 0.999);
        assert!(ActivationKind::Logistic.apply(-20.0) < 0.001);
    }

    #[test]
    fn tanh_is_odd() {
        let a = ActivationKind::Tanh.apply(0.7);
        let b = ActivationKind::Tanh.apply(-0.7);
        assert!((a + b).abs() < 1e-6);
    }
}
