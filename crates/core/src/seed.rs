//! Noise-seed randomization for ComfyUI API-format graphs.
//!
//! A graph is a JSON object of `node_id -> {"class_type", "inputs"}`.
//! Sampler nodes carry their seed in an input named `seed` or
//! `noise_seed`.

use rand::Rng;
use serde_json::Value;

use crate::types::JobGraph;

/// Input names treated as noise seeds.
pub const SEED_INPUTS: &[&str] = &["seed", "noise_seed"];

/// Largest seed handed out. Kept inside the range ComfyUI samplers accept
/// and exactly representable as a JSON number.
pub const MAX_SEED: u64 = (1 << 50) - 1;

/// Return a copy of `graph` with every literal seed input replaced by a
/// fresh random value. The input graph is left untouched.
pub fn randomize_noise_seeds(graph: &JobGraph) -> JobGraph {
    randomize_noise_seeds_with(graph, &mut rand::rng())
}

/// [`randomize_noise_seeds`] with a caller-supplied random source.
pub fn randomize_noise_seeds_with<R: Rng>(graph: &JobGraph, rng: &mut R) -> JobGraph {
    let mut copy = graph.clone();
    let mut replaced = 0usize;

    if let Value::Object(nodes) = copy.as_value_mut() {
        for node in nodes.values_mut() {
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };
            for name in SEED_INPUTS {
                // Linked inputs are arrays (`["node", slot]`); only literal
                // numbers are seeds.
                if let Some(slot) = inputs.get_mut(*name).filter(|v| v.is_number()) {
                    *slot = Value::from(rng.random_range(0..=MAX_SEED));
                    replaced += 1;
                }
            }
        }
    }

    tracing::trace!(replaced, "Randomized noise seeds");
    copy
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    fn graph() -> JobGraph {
        JobGraph::new(json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20}},
            "7": {"class_type": "SamplerCustom", "inputs": {"noise_seed": 2, "cfg": 7.5}},
            "9": {"class_type": "KSampler", "inputs": {"seed": ["12", 0]}},
            "10": {"class_type": "SaveImage", "inputs": {"filename_prefix": "out"}}
        }))
    }

    #[test]
    fn replaces_literal_seeds() {
        let mut rng = StdRng::seed_from_u64(7);
        let randomized = randomize_noise_seeds_with(&graph(), &mut rng);
        let value = randomized.as_value();
        assert!(value["3"]["inputs"]["seed"].as_u64().unwrap() <= MAX_SEED);
        assert!(value["7"]["inputs"]["noise_seed"].is_u64());
        assert_eq!(value["3"]["inputs"]["steps"], 20);
        assert_eq!(value["7"]["inputs"]["cfg"], 7.5);
    }

    #[test]
    fn leaves_linked_seed_inputs_alone() {
        let randomized = randomize_noise_seeds(&graph());
        assert_eq!(randomized.as_value()["9"]["inputs"]["seed"], json!(["12", 0]));
    }

    #[test]
    fn does_not_mutate_the_source_graph() {
        let original = graph();
        let _ = randomize_noise_seeds(&original);
        assert_eq!(original, graph());
    }

    #[test]
    fn independent_copies_get_independent_seeds() {
        let mut rng = StdRng::seed_from_u64(42);
        let a = randomize_noise_seeds_with(&graph(), &mut rng);
        let b = randomize_noise_seeds_with(&graph(), &mut rng);
        assert_ne!(
            a.as_value()["3"]["inputs"]["seed"],
            b.as_value()["3"]["inputs"]["seed"]
        );
    }

    #[test]
    fn non_object_graph_is_returned_unchanged() {
        let graph = JobGraph::new(json!([1, 2, 3]));
        assert_eq!(randomize_noise_seeds(&graph), graph);
    }
}
