//! The copy-on-write genome encoding and its stochastic operations.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::activation::ActivationKind;
use crate::gene::{Innovation, NeuronGene, NeuronId, NeuronLayer, SynapseGene};

/// Probability that a matching-but-disabled synapse is re-enabled in a child.
const CROSSOVER_REENABLE_CHANCE: f32 = 0.1;
/// Probability that a non-sensor-sourced disjoint synapse is inherited.
const CROSSOVER_DISJOINT_CHANCE: f32 = 0.5;
/// Probability that an existing connection is re-weighted instead of split.
const MUTATE_REWEIGHT_CHANCE: f32 = 0.5;

/// Errors surfaced by genome validation.
#[derive(Debug, Error)]
pub enum GenomeError {
    /// A synapse references a neuron id missing from the genome.
    #[error("synapse {innovation:?} references missing neuron {neuron}")]
    DanglingSynapse {
        innovation: Innovation,
        neuron: NeuronId,
    },
    /// Two synapse genes share one innovation number.
    #[error("duplicate innovation number {0:?}")]
    DuplicateInnovation(Innovation),
}

/// Monotonically increasing allocator of innovation numbers, shared by every
/// genome in a run. Atomic so genomes may be created concurrently at birth.
#[derive(Debug, Clone, Default)]
pub struct InnovationCounter(Arc<AtomicU64>);

impl InnovationCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next innovation number.
    pub fn next(&self) -> Innovation {
        Innovation(self.0.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of innovations allocated so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Explicit, seeded context threaded through every stochastic or
/// id-allocating genome call, making the whole pipeline deterministic and
/// unit-testable from a fixed seed.
#[derive(Debug)]
pub struct GenomeContext {
    rng: SmallRng,
    innovations: InnovationCounter,
}

impl GenomeContext {
    /// Fresh context with its own innovation counter.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            innovations: InnovationCounter::new(),
        }
    }

    /// Context sharing an existing run-wide counter (e.g. one per worker).
    #[must_use]
    pub fn with_counter(seed: u64, innovations: InnovationCounter) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            innovations,
        }
    }

    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    #[must_use]
    pub fn innovations(&self) -> &InnovationCounter {
        &self.innovations
    }

    fn next_innovation(&mut self) -> Innovation {
        self.innovations.next()
    }

    fn random_weight(&mut self) -> f32 {
        self.rng.random_range(-1.0..=1.0)
    }
}

/// Immutable graph encoding of a neural network. Every mutating operation
/// returns a new `Genome`; concurrently-held parents remain valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    neurons: Vec<NeuronGene>,
    synapses: Vec<SynapseGene>,
    next_neuron_id: u32,
}

impl Genome {
    /// Fully connected sensor-to-output genome with weights uniform in
    /// [-1, 1]. Sensors carry identity activation, outputs tanh.
    #[must_use]
    pub fn random(num_sensors: usize, num_outputs: usize, ctx: &mut GenomeContext) -> Self {
        let mut neurons = Vec::with_capacity(num_sensors + num_outputs);
        for i in 0..num_sensors {
            neurons.push(NeuronGene::new(
                NeuronId(i as u32),
                NeuronLayer::Sensor,
                ActivationKind::Identity,
            ));
        }
        for i in 0..num_outputs {
            neurons.push(NeuronGene::new(
                NeuronId((num_sensors + i) as u32),
                NeuronLayer::Output,
                ActivationKind::Tanh,
            ));
        }
        let mut synapses = Vec::with_capacity(num_sensors * num_outputs);
        for s in 0..num_sensors {
            for o in 0..num_outputs {
                synapses.push(SynapseGene::new(
                    ctx.next_innovation(),
                    NeuronId(s as u32),
                    NeuronId((num_sensors + o) as u32),
                    ctx.random_weight(),
                ));
            }
        }
        Self {
            neurons,
            synapses,
            next_neuron_id: (num_sensors + num_outputs) as u32,
        }
    }

    /// Assemble a genome from explicit genes, validating the synapse-endpoint
    /// invariant. Intended for collaborators and fixtures, not the hot path.
    pub fn from_genes(
        neurons: Vec<NeuronGene>,
        synapses: Vec<SynapseGene>,
    ) -> Result<Self, GenomeError> {
        let next_neuron_id = neurons
            .iter()
            .map(|n| n.id.0 + 1)
            .max()
            .unwrap_or(0);
        let genome = Self {
            neurons,
            synapses,
            next_neuron_id,
        };
        genome.validate()?;
        Ok(genome)
    }

    /// Check the structural invariants: every synapse endpoint exists and
    /// innovation numbers are unique within the genome.
    pub fn validate(&self) -> Result<(), GenomeError> {
        let mut seen = BTreeMap::new();
        for synapse in &self.synapses {
            if seen.insert(synapse.innovation, ()).is_some() {
                return Err(GenomeError::DuplicateInnovation(synapse.innovation));
            }
            for endpoint in [synapse.source, synapse.target] {
                if self.find_neuron(endpoint).is_none() {
                    return Err(GenomeError::DanglingSynapse {
                        innovation: synapse.innovation,
                        neuron: endpoint,
                    });
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn neurons(&self) -> &[NeuronGene] {
        &self.neurons
    }

    #[must_use]
    pub fn synapses(&self) -> &[SynapseGene] {
        &self.synapses
    }

    fn find_neuron(&self, id: NeuronId) -> Option<&NeuronGene> {
        self.neurons.iter().find(|n| n.id == id)
    }

    /// Look up a neuron gene by id.
    ///
    /// # Panics
    ///
    /// Panics when the id is absent. A missing id cannot arise from normal
    /// stochastic operation, only from a broken collaborator, so it fails
    /// loudly instead of being silently tolerated.
    #[must_use]
    pub fn neuron(&self, id: NeuronId) -> &NeuronGene {
        self.find_neuron(id)
            .unwrap_or_else(|| panic!("neuron {id} is not part of this genome"))
    }

    pub fn layer(&self, layer: NeuronLayer) -> impl Iterator<Item = &NeuronGene> {
        self.neurons.iter().filter(move |n| n.layer == layer)
    }

    /// Labels of sensor genes in declaration order.
    #[must_use]
    pub fn sensor_labels(&self) -> Vec<&str> {
        self.layer(NeuronLayer::Sensor)
            .filter_map(|n| n.label.as_deref())
            .collect()
    }

    /// Labels of output genes in declaration order.
    #[must_use]
    pub fn output_labels(&self) -> Vec<&str> {
        self.layer(NeuronLayer::Output)
            .filter_map(|n| n.label.as_deref())
            .collect()
    }

    #[must_use]
    pub fn enabled_synapses(&self) -> usize {
        self.synapses.iter().filter(|s| !s.disabled).count()
    }

    fn has_label(&self, layer: NeuronLayer, label: &str) -> bool {
        self.layer(layer).any(|n| n.label.as_deref() == Some(label))
    }

    fn enabled_between(&self, source: NeuronId, target: NeuronId) -> Option<usize> {
        self.synapses
            .iter()
            .position(|s| !s.disabled && s.source == source && s.target == target)
    }

    /// Append a labeled sensor wired to every existing output. Idempotent: a
    /// duplicate label returns an unchanged copy.
    #[must_use]
    pub fn add_sensor(&self, label: &str, ctx: &mut GenomeContext) -> Self {
        self.add_terminal(label, NeuronLayer::Sensor, ctx)
    }

    /// Append a labeled output wired from every existing sensor. Idempotent: a
    /// duplicate label returns an unchanged copy.
    #[must_use]
    pub fn add_output(&self, label: &str, ctx: &mut GenomeContext) -> Self {
        self.add_terminal(label, NeuronLayer::Output, ctx)
    }

    fn add_terminal(&self, label: &str, layer: NeuronLayer, ctx: &mut GenomeContext) -> Self {
        if self.has_label(layer, label) {
            return self.clone();
        }
        let mut next = self.clone();
        let id = NeuronId(next.next_neuron_id);
        next.next_neuron_id += 1;
        let activation = match layer {
            NeuronLayer::Sensor => ActivationKind::Identity,
            _ => ActivationKind::Tanh,
        };
        next.neurons
            .push(NeuronGene::labeled(id, layer, activation, label));
        let opposite = match layer {
            NeuronLayer::Sensor => NeuronLayer::Output,
            _ => NeuronLayer::Sensor,
        };
        let peers: Vec<NeuronId> = self.layer(opposite).map(|n| n.id).collect();
        for peer in peers {
            let (source, target) = match layer {
                NeuronLayer::Sensor => (id, peer),
                _ => (peer, id),
            };
            next.synapses.push(SynapseGene::new(
                ctx.next_innovation(),
                source,
                target,
                ctx.random_weight(),
            ));
        }
        next
    }

    /// One structural mutation step. Exactly one of three outcomes:
    ///
    /// - no enabled synapse between the chosen pair: a new synapse gene
    ///   (gene count K becomes K+1);
    /// - existing synapse, re-weight branch: one gene replaced in place with
    ///   the same innovation number (count stays K);
    /// - existing synapse, split branch: the original is disabled and a new
    ///   hidden neuron is wired in series (count becomes K+2, one disabled).
    #[must_use]
    pub fn mutate_structure(&self, ctx: &mut GenomeContext) -> Self {
        let sources: Vec<NeuronId> = self
            .neurons
            .iter()
            .filter(|n| n.layer.can_source())
            .map(|n| n.id)
            .collect();
        let targets: Vec<NeuronId> = self
            .neurons
            .iter()
            .filter(|n| n.layer.can_target())
            .map(|n| n.id)
            .collect();
        if sources.is_empty() || targets.is_empty() {
            return self.clone();
        }
        let source = sources[ctx.rng.random_range(0..sources.len())];
        let target = targets[ctx.rng.random_range(0..targets.len())];

        let mut next = self.clone();
        match self.enabled_between(source, target) {
            None => {
                let weight = ctx.random_weight();
                next.synapses.push(SynapseGene::new(
                    ctx.next_innovation(),
                    source,
                    target,
                    weight,
                ));
            }
            Some(index) => {
                if ctx.rng.random::<f32>() < MUTATE_REWEIGHT_CHANCE {
                    let weight = ctx.random_weight();
                    next.synapses[index] = next.synapses[index].reweighted(weight);
                } else {
                    let original = next.synapses[index];
                    next.synapses[index] = original.disable();
                    let hidden = NeuronId(next.next_neuron_id);
                    next.next_neuron_id += 1;
                    next.neurons.push(NeuronGene::new(
                        hidden,
                        NeuronLayer::Hidden,
                        ActivationKind::Tanh,
                    ));
                    next.synapses.push(SynapseGene::new(
                        ctx.next_innovation(),
                        original.source,
                        hidden,
                        1.0,
                    ));
                    next.synapses.push(SynapseGene::new(
                        ctx.next_innovation(),
                        hidden,
                        original.target,
                        original.weight,
                    ));
                }
            }
        }
        next
    }

    /// Recombine two parents by innovation-number alignment.
    ///
    /// Matching innovations pick either parent's copy uniformly (with a small
    /// chance of re-enabling a disabled gene); disjoint genes are inherited
    /// unconditionally when sourced from a sensor, otherwise with probability
    /// one half. The child's neuron set is the closure of neurons referenced
    /// by the selected synapses, never inherited wholesale.
    #[must_use]
    pub fn crossover(&self, other: &Self, ctx: &mut GenomeContext) -> Self {
        let mine: BTreeMap<Innovation, &SynapseGene> =
            self.synapses.iter().map(|s| (s.innovation, s)).collect();
        let theirs: BTreeMap<Innovation, &SynapseGene> =
            other.synapses.iter().map(|s| (s.innovation, s)).collect();

        // (gene, parent that owns the neuron definitions for its endpoints)
        let mut selected: Vec<(SynapseGene, &Self)> = Vec::new();
        let mut innovations: Vec<Innovation> = mine.keys().copied().collect();
        for key in theirs.keys() {
            if !mine.contains_key(key) {
                innovations.push(*key);
            }
        }
        innovations.sort_unstable();

        for innovation in innovations {
            match (mine.get(&innovation), theirs.get(&innovation)) {
                (Some(a), Some(b)) => {
                    let (gene, parent): (&SynapseGene, &Self) =
                        if ctx.rng.random::<f32>() < 0.5 {
                            (*a, self)
                        } else {
                            (*b, other)
                        };
                    let mut gene = *gene;
                    if gene.disabled && ctx.rng.random::<f32>() < CROSSOVER_REENABLE_CHANCE {
                        gene = gene.enable();
                    }
                    selected.push((gene, parent));
                }
                (Some(gene), None) => {
                    if self.inherit_disjoint(gene, ctx) {
                        selected.push((**gene, self));
                    }
                }
                (None, Some(gene)) => {
                    if other.inherit_disjoint(gene, ctx) {
                        selected.push((**gene, other));
                    }
                }
                (None, None) => unreachable!("innovation came from one of the parents"),
            }
        }

        // Closure of neurons actually referenced by the selected synapses.
        let mut neurons: BTreeMap<NeuronId, NeuronGene> = BTreeMap::new();
        for (gene, parent) in &selected {
            for endpoint in [gene.source, gene.target] {
                neurons
                    .entry(endpoint)
                    .or_insert_with(|| parent.neuron(endpoint).clone());
            }
        }

        let next_neuron_id = self.next_neuron_id.max(other.next_neuron_id);
        Self {
            neurons: neurons.into_values().collect(),
            synapses: selected.into_iter().map(|(gene, _)| gene).collect(),
            next_neuron_id,
        }
    }

    fn inherit_disjoint(&self, gene: &SynapseGene, ctx: &mut GenomeContext) -> bool {
        self.neuron(gene.source).layer == NeuronLayer::Sensor
            || ctx.rng.random::<f32>() < CROSSOVER_DISJOINT_CHANCE
    }
}
