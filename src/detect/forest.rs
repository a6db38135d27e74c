//! Isolation forest over standardized one-dimensional readings.
//!
//! Readings that are easy to isolate with random splits have short average
//! path lengths and therefore high isolation scores. The raw score is taken
//! relative to the training set's `1 - contamination` quantile so that the
//! expected share of the baseline scores zero.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detect::scorer::OutlierScorer;
use crate::detect::DetectError;
use crate::window::stats;

const DEFAULT_TREES: usize = 50;
const DEFAULT_MAX_SAMPLES: usize = 256;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf { size: usize },
    Split { threshold: f64, left: usize, right: usize },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn grow(samples: Vec<f64>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut nodes = Vec::new();
        grow_node(&mut nodes, samples, 0, max_depth, rng);
        Self { nodes }
    }

    fn path_length(&self, x: f64) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[idx] {
                Node::Leaf { size } => return depth + average_path_length(size),
                Node::Split {
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x < threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn grow_node(
    nodes: &mut Vec<Node>,
    samples: Vec<f64>,
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> usize {
    let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if depth >= max_depth || samples.len() <= 1 || !(lo < hi) {
        nodes.push(Node::Leaf {
            size: samples.len(),
        });
        return nodes.len() - 1;
    }

    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<f64>, Vec<f64>) = samples.into_iter().partition(|&x| x < threshold);

    let idx = nodes.len();
    nodes.push(Node::Leaf { size: 0 });
    let left = grow_node(nodes, left, depth + 1, max_depth, rng);
    let right = grow_node(nodes, right, depth + 1, max_depth, rng);
    nodes[idx] = Node::Split {
        threshold,
        left,
        right,
    };
    idx
}

/// Average path length of an unsuccessful BST search over `n` items.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
struct Model {
    trees: Vec<Tree>,
    sample_size: usize,
    center: f64,
    scale: f64,
    /// Raw score at the contamination quantile of the training set.
    offset: f64,
}

impl Model {
    fn raw_score(&self, standardized: f64) -> f64 {
        let mean_path = self
            .trees
            .iter()
            .map(|t| t.path_length(standardized))
            .sum::<f64>()
            / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / norm)
    }
}

/// Trainable scorer backed by an isolation forest.
#[derive(Debug, Clone)]
pub struct IsolationForestScorer {
    n_trees: usize,
    max_samples: usize,
    contamination: f64,
    rng: StdRng,
    model: Option<Model>,
}

impl IsolationForestScorer {
    pub fn new(contamination: f64, seed: u64) -> Self {
        Self {
            n_trees: DEFAULT_TREES,
            max_samples: DEFAULT_MAX_SAMPLES,
            contamination,
            rng: StdRng::seed_from_u64(seed),
            model: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }
}

impl OutlierScorer for IsolationForestScorer {
    fn fit(&mut self, samples: &[f64]) -> Result<(), DetectError> {
        if samples.len() < 2 {
            return Err(DetectError::InsufficientBaseline {
                needed: 2,
                have: samples.len(),
            });
        }
        let center = stats::mean(samples)?;
        let scale = match stats::std_dev(samples)? {
            s if s > 0.0 => s,
            _ => 1.0,
        };
        let standardized: Vec<f64> = samples.iter().map(|&x| (x - center) / scale).collect();

        let sample_size = self.max_samples.min(standardized.len());
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..self.n_trees)
            .map(|_| {
                let subsample: Vec<f64> =
                    rand::seq::index::sample(&mut self.rng, standardized.len(), sample_size)
                        .into_iter()
                        .map(|i| standardized[i])
                        .collect();
                Tree::grow(subsample, max_depth, &mut self.rng)
            })
            .collect();

        let mut model = Model {
            trees,
            sample_size,
            center,
            scale,
            offset: 0.0,
        };

        let training_scores: Vec<f64> = standardized.iter().map(|&x| model.raw_score(x)).collect();
        model.offset = stats::percentile(&training_scores, (1.0 - self.contamination) * 100.0)?;

        self.model = Some(model);
        Ok(())
    }

    fn score(&self, value: f64) -> Result<f64, DetectError> {
        let model = self.model.as_ref().ok_or(DetectError::NotFitted)?;
        if !value.is_finite() {
            return Err(DetectError::NonFinite(value));
        }
        let raw = model.raw_score((value - model.center) / model.scale);
        if model.offset >= 1.0 {
            return Ok(0.0);
        }
        Ok(((raw - model.offset) / (1.0 - model.offset)).clamp(0.0, 1.0))
    }
}
