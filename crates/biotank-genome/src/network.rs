//! Compiled, executable phenotype built once from a genome at birth.

use std::collections::HashMap;

use crate::activation::ActivationKind;
use crate::gene::{NeuronId, NeuronLayer};
use crate::genome::Genome;

/// Runtime neuron. Topology is fixed for the organism's life; only the
/// scalar state changes.
#[derive(Debug, Clone)]
pub struct Neuron {
    id: NeuronId,
    layer: NeuronLayer,
    activation: ActivationKind,
    /// (index into the network's neuron array, synapse weight)
    inputs: Vec<(usize, f32)>,
    depth: u32,
    current: f32,
    last: f32,
    next: f32,
}

impl Neuron {
    #[must_use]
    pub const fn id(&self) -> NeuronId {
        self.id
    }

    #[must_use]
    pub const fn layer(&self) -> NeuronLayer {
        self.layer
    }

    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub const fn state(&self) -> f32 {
        self.current
    }

    /// State committed one tick earlier.
    #[must_use]
    pub const fn last_state(&self) -> f32 {
        self.last
    }
}

#[derive(Clone, Copy, PartialEq)]
enum DepthMark {
    Unvisited,
    InProgress,
    Done(u32),
}

/// The full compiled neuron graph with cached sensor/output indices and the
/// cached maximum depth.
///
/// Tick semantics are synchronous and double-buffered: every neuron computes
/// its next state from the previous tick's states, and only then does the
/// network commit. Evaluation order never affects the result within one tick;
/// a loop in the graph behaves as one-tick-delayed feedback rather than an
/// error.
#[derive(Debug, Clone)]
pub struct NeuralNetwork {
    neurons: Vec<Neuron>,
    /// Evaluation order, sorted by depth. Not required for correctness under
    /// double buffering, but keeps traces and debugging predictable.
    order: Vec<usize>,
    sensors: Vec<usize>,
    outputs: Vec<usize>,
    max_depth: u32,
}

impl NeuralNetwork {
    /// Compile a genome: one runtime neuron per gene, input lists from the
    /// enabled synapses targeting each non-sensor neuron.
    #[must_use]
    pub fn build(genome: &Genome) -> Self {
        let index_of: HashMap<NeuronId, usize> = genome
            .neurons()
            .iter()
            .enumerate()
            .map(|(idx, gene)| (gene.id, idx))
            .collect();

        let mut neurons: Vec<Neuron> = genome
            .neurons()
            .iter()
            .map(|gene| Neuron {
                id: gene.id,
                layer: gene.layer,
                activation: gene.activation,
                inputs: Vec::new(),
                depth: 0,
                current: 0.0,
                last: 0.0,
                next: 0.0,
            })
            .collect();

        for synapse in genome.synapses() {
            if synapse.disabled {
                continue;
            }
            let source = index_of[&synapse.source];
            let target = index_of[&synapse.target];
            if neurons[target].layer == NeuronLayer::Sensor {
                continue;
            }
            neurons[target].inputs.push((source, synapse.weight));
        }

        let sensors: Vec<usize> = neurons
            .iter()
            .enumerate()
            .filter(|(_, n)| n.layer == NeuronLayer::Sensor)
            .map(|(idx, _)| idx)
            .collect();
        let outputs: Vec<usize> = neurons
            .iter()
            .enumerate()
            .filter(|(_, n)| n.layer == NeuronLayer::Output)
            .map(|(idx, _)| idx)
            .collect();

        let mut marks = vec![DepthMark::Unvisited; neurons.len()];
        for &output in &outputs {
            Self::compute_depth(&neurons, &mut marks, output);
        }
        for (idx, mark) in marks.iter().enumerate() {
            if let DepthMark::Done(depth) = mark {
                neurons[idx].depth = *depth;
            }
        }

        // Outputs must evaluate strictly after every hidden neuron: when a
        // hidden neuron reaches an output's depth, push all outputs one level
        // deeper.
        let max_hidden = neurons
            .iter()
            .filter(|n| n.layer == NeuronLayer::Hidden)
            .map(|n| n.depth)
            .max();
        if let Some(max_hidden) = max_hidden {
            for &output in &outputs {
                if neurons[output].depth <= max_hidden {
                    neurons[output].depth = max_hidden + 1;
                }
            }
        }

        let max_depth = neurons.iter().map(|n| n.depth).max().unwrap_or(0);
        let mut order: Vec<usize> = (0..neurons.len()).collect();
        order.sort_by_key(|&idx| neurons[idx].depth);

        Self {
            neurons,
            order,
            sensors,
            outputs,
            max_depth,
        }
    }

    /// Depth-first traversal backward through enabled inputs. The mark array
    /// is the visited set that guarantees termination on cyclic graphs: an
    /// in-progress input contributes nothing, turning the loop into a
    /// one-tick-delayed feedback edge.
    fn compute_depth(neurons: &[Neuron], marks: &mut [DepthMark], idx: usize) -> u32 {
        match marks[idx] {
            DepthMark::Done(depth) => return depth,
            DepthMark::InProgress => return 0,
            DepthMark::Unvisited => {}
        }
        if neurons[idx].layer == NeuronLayer::Sensor {
            marks[idx] = DepthMark::Done(0);
            return 0;
        }
        marks[idx] = DepthMark::InProgress;
        let mut depth = 0;
        for &(input, _) in &neurons[idx].inputs {
            if marks[input] == DepthMark::InProgress {
                continue;
            }
            depth = depth.max(1 + Self::compute_depth(neurons, marks, input));
        }
        // A non-sensor with inputs sits at least one level deep.
        if !neurons[idx].inputs.is_empty() {
            depth = depth.max(1);
        }
        marks[idx] = DepthMark::Done(depth);
        depth
    }

    /// Drive the sensor neurons. Values beyond the sensor count are ignored;
    /// missing values leave the remaining sensors unchanged.
    pub fn set_inputs(&mut self, values: &[f32]) {
        for (&idx, &value) in self.sensors.iter().zip(values) {
            let neuron = &mut self.neurons[idx];
            neuron.current = value;
        }
    }

    /// One synchronous network step: compute every non-sensor neuron's next
    /// state from the previous tick's states, then commit everywhere.
    pub fn tick(&mut self) {
        for &idx in &self.order {
            if self.neurons[idx].layer == NeuronLayer::Sensor {
                continue;
            }
            let sum: f32 = self.neurons[idx]
                .inputs
                .iter()
                .map(|&(input, weight)| weight * self.neurons[input].current)
                .sum();
            self.neurons[idx].next = self.neurons[idx].activation.apply(sum);
        }
        for neuron in &mut self.neurons {
            neuron.last = neuron.current;
            if neuron.layer != NeuronLayer::Sensor {
                neuron.current = neuron.next;
            }
        }
    }

    /// Current output-neuron states in declaration order.
    #[must_use]
    pub fn outputs(&self) -> Vec<f32> {
        self.outputs
            .iter()
            .map(|&idx| self.neurons[idx].current)
            .collect()
    }

    #[must_use]
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[must_use]
    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }
}
