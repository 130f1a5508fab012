use crate::alignment::ctc::extend_with_blanks;
use crate::alignment::two_state::Transitions;
use crate::error::LossError;

/// One arc of the batch automaton. Taking it consumes one frame and emits
/// `emission`; `weight` is a `-log` score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub emission: usize,
    pub sequence: usize,
    pub weight: f32,
}

/// Edge list over a state space shared by the whole batch. Each batch item
/// owns a disjoint set of states and one `(start, end)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Automaton {
    pub num_states: usize,
    pub edges: Vec<Edge>,
    pub start_end_states: Vec<(usize, usize)>,
}

impl Automaton {
    pub fn batch(&self) -> usize {
        self.start_end_states.len()
    }

    pub fn validate(&self, batch: usize, n_classes: usize) -> Result<(), LossError> {
        if self.start_end_states.len() != batch {
            return Err(LossError::shape(
                "automaton",
                format!(
                    "{} start/end pairs for a batch of {batch}",
                    self.start_end_states.len()
                ),
            ));
        }
        if let Some(&(s, e)) = self
            .start_end_states
            .iter()
            .find(|(s, e)| *s >= self.num_states || *e >= self.num_states)
        {
            return Err(LossError::shape(
                "automaton",
                format!("start/end ({s}, {e}) outside {} states", self.num_states),
            ));
        }
        for edge in &self.edges {
            if edge.from >= self.num_states || edge.to >= self.num_states {
                return Err(LossError::shape(
                    "automaton",
                    format!(
                        "edge {} -> {} outside {} states",
                        edge.from, edge.to, self.num_states
                    ),
                ));
            }
            if edge.emission >= n_classes {
                return Err(LossError::shape(
                    "automaton",
                    format!("emission {} out of range for {n_classes} classes", edge.emission),
                ));
            }
            if edge.sequence >= batch {
                return Err(LossError::shape(
                    "automaton",
                    format!("edge tagged with sequence {} in a batch of {batch}", edge.sequence),
                ));
            }
            if !edge.weight.is_finite() {
                return Err(LossError::degenerate(
                    "automaton",
                    format!("edge {} -> {} has weight {}", edge.from, edge.to, edge.weight),
                ));
            }
        }
        Ok(())
    }
}

/// Builds a left-to-right automaton per sequence from a list of chain
/// positions. `arcs(p)` yields `(predecessor, weight)` for position `p`, where
/// `None` is the initial state. Arcs into the final positions are mirrored into
/// a dedicated end state.
fn linear_automaton<F>(chains: &[(Vec<usize>, Vec<usize>)], arcs: F) -> Automaton
where
    F: Fn(&[usize], usize) -> Vec<(Option<usize>, f32)>,
{
    let mut automaton = Automaton::default();
    for (b, (positions, finals)) in chains.iter().enumerate() {
        let initial = automaton.num_states;
        let first = initial + 1;
        let end = first + positions.len();
        automaton.num_states = end + 1;
        automaton.start_end_states.push((initial, end));
        for p in 0..positions.len() {
            for (pred, weight) in arcs(positions, p) {
                let from = pred.map_or(initial, |q| first + q);
                let edge = Edge {
                    from,
                    to: first + p,
                    emission: positions[p],
                    sequence: b,
                    weight,
                };
                automaton.edges.push(edge);
                if finals.contains(&p) {
                    automaton.edges.push(Edge { to: end, ..edge });
                }
            }
        }
    }
    automaton
}

/// CTC topology: blank-augmented label chain with optional blank skips.
pub fn ctc_topology(sequences: &[Vec<usize>], blank: usize) -> Automaton {
    let chains: Vec<(Vec<usize>, Vec<usize>)> = sequences
        .iter()
        .map(|labels| {
            let extended = extend_with_blanks(labels, blank);
            let last = extended.len() - 1;
            let finals = if last >= 1 { vec![last - 1, last] } else { vec![last] };
            (extended, finals)
        })
        .collect();
    linear_automaton(&chains, |positions, p| {
        let mut arcs = Vec::with_capacity(3);
        if p <= 1 {
            arcs.push((None, 0.0));
        }
        arcs.push((Some(p), 0.0));
        if p >= 1 {
            arcs.push((Some(p - 1), 0.0));
        }
        if p >= 2 && positions[p] != blank && positions[p] != positions[p - 2] {
            arcs.push((Some(p - 2), 0.0));
        }
        arcs
    })
}

/// Two-state HMM topology: each label becomes an entry and an exit state.
pub fn hmm_topology(sequences: &[Vec<usize>], tdp: Transitions) -> Automaton {
    let chains: Vec<(Vec<usize>, Vec<usize>)> = sequences
        .iter()
        .map(|labels| {
            let states: Vec<usize> = labels.iter().flat_map(|&l| [l, l]).collect();
            let finals = states.len().checked_sub(1).into_iter().collect();
            (states, finals)
        })
        .collect();
    linear_automaton(&chains, |_, p| {
        let mut arcs = Vec::with_capacity(2);
        if p == 0 {
            arcs.push((None, 0.0));
        }
        arcs.push((Some(p), -tdp.self_loop));
        if p >= 1 {
            arcs.push((Some(p - 1), -tdp.forward));
        }
        arcs
    })
}
