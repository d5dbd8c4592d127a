//! Evolvable neural-network genomes and their compiled phenotypes.
//!
//! A [`Genome`] is an immutable value snapshot: every mutating operation
//! returns a new genome, so parent genomes held by live organisms stay valid.
//! Structural mutations are tagged with globally unique innovation numbers
//! drawn from an [`InnovationCounter`] shared by the whole run, which is what
//! lets [`Genome::crossover`] align corresponding genes across unrelated
//! lineages. [`NeuralNetwork::build`] compiles a genome into a runtime neuron
//! graph evaluated with synchronous double-buffered ticks.

pub mod activation;
pub mod gene;
pub mod genome;
pub mod network;

pub use activation::ActivationKind;
pub use gene::{Innovation, NeuronGene, NeuronId, NeuronLayer, SynapseGene};
pub use genome::{Genome, GenomeContext, GenomeError, InnovationCounter};
pub use network::{NeuralNetwork, Neuron};
