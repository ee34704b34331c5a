//! Random chunk mutation.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// A single kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// Overwrite one byte with a random value.
    Change,
    /// Insert one random byte.
    Insert,
    /// Remove a run of bytes. At least one byte always survives.
    Delete,
}

impl Modifier {
    pub const ALL: [Modifier; 3] = [Modifier::Change, Modifier::Insert, Modifier::Delete];
}

/// Applies up to `max_modifications` random mutations to a chunk.
#[derive(Debug)]
pub struct Fuzzer {
    max_modifications: usize,
    modifiers: Vec<Modifier>,
    rng: Mutex<StdRng>,
}

impl Fuzzer {
    /// Create a fuzzer. An empty `modifiers` list means all modifiers.
    pub fn new(max_modifications: usize, modifiers: Vec<Modifier>, seed: Option<u64>) -> Self {
        let modifiers = if modifiers.is_empty() {
            Modifier::ALL.to_vec()
        } else {
            modifiers
        };
        let seed = seed.unwrap_or_else(rand::random);
        Self {
            max_modifications,
            modifiers,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Mutate `chunk` in place.
    pub fn fuzz(&self, chunk: &mut Vec<u8>) {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for _ in 0..self.max_modifications {
            let modifier = self.modifiers[rng.random_range(0..self.modifiers.len())];
            apply_modifier(&mut *rng, modifier, chunk);
        }
    }

    /// Draw a uniform sample in `[0, 1)` from the fuzzer's generator.
    pub(crate) fn sample(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .random::<f64>()
    }
}

fn apply_modifier<R: Rng>(rng: &mut R, modifier: Modifier, chunk: &mut Vec<u8>) {
    if chunk.is_empty() {
        if modifier == Modifier::Insert {
            chunk.push(rng.random());
        }
        return;
    }

    match modifier {
        Modifier::Change => {
            let index = rng.random_range(0..chunk.len());
            chunk[index] = rng.random();
        }
        Modifier::Insert => {
            let index = rng.random_range(0..=chunk.len());
            chunk.insert(index, rng.random());
        }
        Modifier::Delete => {
            let index = rng.random_range(0..chunk.len());
            let max_run = chunk.len() - index - 1;
            let run = rng.random_range(0..=max_run);
            chunk.drain(index..index + run);
        }
    }
}
