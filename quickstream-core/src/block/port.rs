//! Stream ports and their connections.
//!
//! An input port accepts at most one feeder; an output port fans out to
//! any number of readers. Connections reference blocks weakly so a
//! destroyed block can never be kept alive, or dereferenced, through a
//! stale edge.

use crate::block::Block;
use crate::module::Packet;
use std::collections::VecDeque;
use std::sync::Weak;

/// The output end feeding an input port.
pub(crate) struct Feeder {
    pub(crate) block: Weak<Block>,
    pub(crate) output: usize,
}

/// An input port consuming a reader-side packet queue.
pub(crate) struct InputPort {
    pub(crate) name: String,
    pub(crate) feeder: Option<Feeder>,
    pub(crate) queue: VecDeque<Packet>,
}

impl InputPort {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            feeder: None,
            queue: VecDeque::new(),
        }
    }
}

/// The input end reached by an output port.
pub(crate) struct Reader {
    pub(crate) block: Weak<Block>,
    pub(crate) input: usize,
}

/// An output port fanning out to zero or more readers.
pub(crate) struct OutputPort {
    pub(crate) name: String,
    pub(crate) readers: Vec<Reader>,
}

impl OutputPort {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            readers: Vec::new(),
        }
    }
}

/// All stream ports of a simple block, guarded by one lock so connection
/// state and queued packets always change together.
#[derive(Default)]
pub(crate) struct Ports {
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) max_inputs: Option<usize>,
    pub(crate) max_outputs: Option<usize>,
}

impl Ports {
    pub(crate) fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub(crate) fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    /// Snapshot which ports have live connections.
    pub(crate) fn connection_snapshot(&self) -> (Vec<bool>, Vec<bool>) {
        let inputs = self
            .inputs
            .iter()
            .map(|p| p.feeder.as_ref().is_some_and(|f| f.block.strong_count() > 0))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|p| p.readers.iter().any(|r| r.block.strong_count() > 0))
            .collect();
        (inputs, outputs)
    }

    /// Move every queued packet out, leaving the queues empty.
    pub(crate) fn drain_queues(&mut self) -> Vec<Vec<Packet>> {
        self.inputs
            .iter_mut()
            .map(|p| p.queue.drain(..).collect())
            .collect()
    }
}
