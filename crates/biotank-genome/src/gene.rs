//! Gene-level building blocks of the genome encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::activation::ActivationKind;

/// Identifier of a neuron gene, unique only within its own genome.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NeuronId(pub u32);

impl fmt::Display for NeuronId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Globally unique identifier of a structural mutation, shared process-wide
/// so corresponding genes align across unrelated genomes during crossover.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Innovation(pub u64);

/// The three layer roles a neuron gene may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NeuronLayer {
    Sensor,
    Hidden,
    Output,
}

impl NeuronLayer {
    /// Whether a neuron of this layer may act as a synapse source.
    #[must_use]
    pub const fn can_source(self) -> bool {
        matches!(self, Self::Sensor | Self::Hidden)
    }

    /// Whether a neuron of this layer may act as a synapse target.
    #[must_use]
    pub const fn can_target(self) -> bool {
        matches!(self, Self::Hidden | Self::Output)
    }
}

/// A neuron gene. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronGene {
    pub id: NeuronId,
    pub layer: NeuronLayer,
    pub activation: ActivationKind,
    pub label: Option<String>,
}

impl NeuronGene {
    #[must_use]
    pub fn new(id: NeuronId, layer: NeuronLayer, activation: ActivationKind) -> Self {
        Self {
            id,
            layer,
            activation,
            label: None,
        }
    }

    #[must_use]
    pub fn labeled(
        id: NeuronId,
        layer: NeuronLayer,
        activation: ActivationKind,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id,
            layer,
            activation,
            label: Some(label.into()),
        }
    }
}

/// A synapse gene. Never mutated in place: a weight change replaces the gene
/// with a new value carrying the same innovation number, and a split disables
/// it permanently for the lineage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynapseGene {
    pub innovation: Innovation,
    pub source: NeuronId,
    pub target: NeuronId,
    pub weight: f32,
    pub disabled: bool,
}

impl SynapseGene {
    #[must_use]
    pub const fn new(
        innovation: Innovation,
        source: NeuronId,
        target: NeuronId,
        weight: f32,
    ) -> Self {
        Self {
            innovation,
            source,
            target,
            weight,
            disabled: false,
        }
    }

    /// Copy of this gene with a replacement weight and the same innovation.
    #[must_use]
    pub const fn reweighted(self, weight: f32) -> Self {
        Self { weight, ..self }
    }

    /// Copy of this gene marked disabled.
    #[must_use]
    pub const fn disable(self) -> Self {
        Self {
            disabled: true,
            ..self
        }
    }

    /// Copy of this gene re-enabled (crossover only).
    #[must_use]
    pub const fn enable(self) -> Self {
        Self {
            disabled: false,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_roles_match_wiring_rules() {
        assert!(NeuronLayer::Sensor.can_source());
        assert!(!NeuronLayer::Sensor.can_target());
        assert!(NeuronLayer::Hidden.can_source());
        assert!(NeuronLayer::Hidden.can_target());
        assert!(!NeuronLayer::Output.can_source());
        assert!(NeuronLayer::Output.can_target());
    }

    #[test]
    fn reweight_preserves_innovation() {
        let gene = SynapseGene::new(Innovation(7), NeuronId(0), NeuronId(1), 0.25);
        let replacement = gene.reweighted(-0.9);
        assert_eq!(replacement.innovation, Innovation(7));
        assert_eq!(replacement.weight, -0.9);
        assert!(!replacement.disabled);
    }

    #[test]
    fn disable_round_trips_through_enable() {
        let gene = SynapseGene::new(Innovation(1), NeuronId(0), NeuronId(1), 1.0);
        let disabled = gene.disable();
        assert!(disabled.disabled);
        assert!(!disabled.enable().disabled);
    }
}
