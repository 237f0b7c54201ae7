use std::hash::BuildHasher;

use foldhash::fast::FixedState;
use serde::{Deserialize, Serialize};

use crate::{Result, ShardError};

/// Configuration for the perfect hash function built over a shard's keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardHashConfig {
    /// Name of the perfect hash construction.
    pub name: String,
    /// Parameters for the construction.
    pub parameters: serde_json::Value,
}

impl Default for ShardHashConfig {
    fn default() -> Self {
        ShardHashConfig {
            name: BBHashLoader::NAME.to_string(),
            parameters: serde_json::json!({ "seed": 0, "gamma": BBHashLoader::DEFAULT_GAMMA }),
        }
    }
}

/// A minimal perfect hash function over a fixed key set.
pub trait PerfectHashFunction {
    /// Number of keys the function was built over.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps `key` to its bucket.
    ///
    /// For keys of the original set this is a bijection onto `[0, len)`. Any
    /// other key still yields some integer, possibly out of range; callers
    /// must verify the stored key at the returned bucket.
    fn index(&self, key: &[u8]) -> u64;

    /// Serializes the function so that [`ShardHashLoader::load`] can rebuild it.
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Builds and reloads perfect hash functions for a shard.
pub trait ShardHashLoader {
    type Function: PerfectHashFunction;

    /// Builds a function mapping `keys` one-to-one onto `[0, keys.len())`.
    fn build(config: &ShardHashConfig, keys: &[&[u8]]) -> Result<Self::Function>;

    /// Rebuilds a function from the output of [`PerfectHashFunction::to_bytes`].
    fn load(config: &ShardHashConfig, data: &[u8]) -> Result<Self::Function>;
}

/// Default loader producing [`BBHashFunction`]s.
#[derive(Debug, Default)]
pub struct BBHashLoader;

impl BBHashLoader {
    pub const NAME: &'static str = "bbhash";
    pub const DEFAULT_GAMMA: f64 = 2.0;
    pub const MAX_LEVELS: usize = 32;

    fn check_name(config: &ShardHashConfig) -> Result<()> {
        if config.name != Self::NAME {
            return Err(ShardError::HashConstruction(format!(
                "unsupported hash type: {}",
                config.name
            )));
        }
        Ok(())
    }

    fn seed(config: &ShardHashConfig) -> Result<u64> {
        config
            .parameters
            .get("seed")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                ShardError::HashConstruction(
                    "missing or invalid 'seed' parameter for bbhash".to_string(),
                )
            })
    }

    fn gamma(config: &ShardHashConfig) -> Result<f64> {
        let gamma = match config.parameters.get("gamma") {
            None => Self::DEFAULT_GAMMA,
            Some(value) => value.as_f64().ok_or_else(|| {
                ShardError::HashConstruction("invalid 'gamma' parameter for bbhash".to_string())
            })?,
        };
        if !(1.0..=16.0).contains(&gamma) {
            return Err(ShardError::HashConstruction(format!(
                "gamma {} outside [1, 16]",
                gamma
            )));
        }
        Ok(gamma)
    }
}

impl ShardHashLoader for BBHashLoader {
    type Function = BBHashFunction;

    fn build(config: &ShardHashConfig, keys: &[&[u8]]) -> Result<Self::Function> {
        Self::check_name(config)?;
        BBHashFunction::build(keys, Self::seed(config)?, Self::gamma(config)?)
    }

    fn load(config: &ShardHashConfig, data: &[u8]) -> Result<Self::Function> {
        Self::check_name(config)?;
        let function: BBHashFunction = rmp_serde::from_slice(data).map_err(|e| {
            ShardError::corrupt(format!("failed to deserialize bbhash function: {}", e))
        })?;
        function.check()?;
        Ok(function)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct BBHashLevel {
    bins: u64,
    /// Bins hit by exactly one key at this level.
    bits: Vec<u64>,
    /// Number of set bits preceding each word, across all levels.
    ranks: Vec<u64>,
}

/// Multi-level "hash, keep singletons, retry the rest" minimal perfect hash.
///
/// Each level hashes the keys left over by the previous levels into
/// `gamma * remaining` bins. Keys landing alone in a bin are assigned the rank
/// of that bin among all singleton bins seen so far.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BBHashFunction {
    len: u64,
    seed: u64,
    levels: Vec<BBHashLevel>,
}

impl BBHashFunction {
    fn build(keys: &[&[u8]], seed: u64, gamma: f64) -> Result<Self> {
        let mut remaining: Vec<&[u8]> = keys.to_vec();
        let mut levels = Vec::new();
        let mut rank = 0u64;

        while !remaining.is_empty() {
            if levels.len() >= BBHashLoader::MAX_LEVELS {
                return Err(ShardError::HashConstruction(format!(
                    "{} keys left unplaced after {} levels",
                    remaining.len(),
                    BBHashLoader::MAX_LEVELS
                )));
            }

            let hasher = level_hasher(seed, levels.len());
            let bins = ((remaining.len() as f64 * gamma).ceil() as u64).max(1);
            let words = bins.div_ceil(64) as usize;
            let mut seen = vec![0u64; words];
            let mut collided = vec![0u64; words];
            for key in &remaining {
                let bin = hasher.hash_one(key) % bins;
                let (word, mask) = bit_position(bin);
                if seen[word] & mask != 0 {
                    collided[word] |= mask;
                } else {
                    seen[word] |= mask;
                }
            }

            let bits: Vec<u64> = seen
                .iter()
                .zip(collided.iter())
                .map(|(s, c)| s & !c)
                .collect();
            let mut ranks = Vec::with_capacity(words);
            for word in &bits {
                ranks.push(rank);
                rank += word.count_ones() as u64;
            }

            remaining.retain(|key| {
                let (word, mask) = bit_position(hasher.hash_one(key) % bins);
                bits[word] & mask == 0
            });
            levels.push(BBHashLevel { bins, bits, ranks });
        }

        if rank != keys.len() as u64 {
            return Err(ShardError::HashConstruction(format!(
                "assigned {} buckets to {} keys",
                rank,
                keys.len()
            )));
        }

        Ok(BBHashFunction {
            len: keys.len() as u64,
            seed,
            levels,
        })
    }

    fn check(&self) -> Result<()> {
        let mut rank = 0u64;
        for level in &self.levels {
            let words = level.bins.div_ceil(64);
            if level.bins == 0 || level.bits.len() as u64 != words || level.ranks.len() as u64 != words
            {
                return Err(ShardError::corrupt("malformed bbhash level"));
            }
            for (word, &expected) in level.bits.iter().zip(level.ranks.iter()) {
                if expected != rank {
                    return Err(ShardError::corrupt("inconsistent bbhash rank table"));
                }
                rank += word.count_ones() as u64;
            }
        }
        if rank != self.len {
            return Err(ShardError::corrupt(format!(
                "bbhash ranks {} keys but records {}",
                rank, self.len
            )));
        }
        Ok(())
    }
}

impl PerfectHashFunction for BBHashFunction {
    fn len(&self) -> u64 {
        self.len
    }

    fn index(&self, key: &[u8]) -> u64 {
        for (i, level) in self.levels.iter().enumerate() {
            let bin = level_hasher(self.seed, i).hash_one(key) % level.bins;
            let (word, mask) = bit_position(bin);
            let bits = level.bits[word];
            if bits & mask != 0 {
                return level.ranks[word] + (bits & (mask - 1)).count_ones() as u64;
            }
        }
        // Not in the key set.
        self.len
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| {
            ShardError::HashConstruction(format!("failed to serialize bbhash function: {}", e))
        })
    }
}

fn level_hasher(seed: u64, level: usize) -> FixedState {
    FixedState::with_seed(seed ^ (level as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

#[inline]
fn bit_position(bin: u64) -> (usize, u64) {
    ((bin / 64) as usize, 1u64 << (bin % 64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u32) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                let mut key = [0u8; 32];
                key[..4].copy_from_slice(&i.to_le_bytes());
                key.to_vec()
            })
            .collect()
    }

    #[test]
    fn test_default_hash_config() {
        let mut config = ShardHashConfig::default();
        assert_eq!(config.name, "bbhash");
        assert_eq!(config.parameters["seed"], 0);
        BBHashLoader::build(&config, &[]).unwrap();

        config.parameters = serde_json::json!({ "seed": 1, "gamma": 0.5 });
        BBHashLoader::build(&config, &[]).unwrap_err();

        config.parameters = serde_json::json!({});
        BBHashLoader::build(&config, &[]).unwrap_err();

        config.name = "unknown".to_string();
        config.parameters = serde_json::json!({ "seed": 1 });
        BBHashLoader::build(&config, &[]).unwrap_err();
    }

    #[test]
    fn test_bijection() {
        let keys = keys(10_000);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let config = ShardHashConfig::default();
        let function = BBHashLoader::build(&config, &refs).unwrap();
        assert_eq!(function.len(), 10_000);

        let mut seen = vec![false; keys.len()];
        for key in &refs {
            let index = function.index(key) as usize;
            assert!(index < seen.len());
            assert!(!seen[index], "bucket {} assigned twice", index);
            seen[index] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_reload_is_deterministic() {
        let keys = keys(1000);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let config = ShardHashConfig {
            name: "bbhash".to_string(),
            parameters: serde_json::json!({ "seed": 42, "gamma": 1.5 }),
        };
        let function = BBHashLoader::build(&config, &refs).unwrap();
        let data = function.to_bytes().unwrap();
        let loaded = BBHashLoader::load(&config, &data).unwrap();
        assert_eq!(function, loaded);
        for key in &refs {
            assert_eq!(function.index(key), loaded.index(key));
        }

        BBHashLoader::load(&config, b"invalid data").unwrap_err();
        let other = ShardHashConfig {
            name: "foldhash".to_string(),
            parameters: serde_json::json!({ "seed": 42 }),
        };
        BBHashLoader::load(&other, &data).unwrap_err();
    }

    #[test]
    fn test_load_rejects_tampered_ranks() {
        let keys = keys(100);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let mut function = BBHashLoader::build(&ShardHashConfig::default(), &refs).unwrap();
        function.len += 1;
        let data = rmp_serde::to_vec(&function).unwrap();
        BBHashLoader::load(&ShardHashConfig::default(), &data).unwrap_err();
    }

    #[test]
    fn test_empty_function() {
        let function = BBHashLoader::build(&ShardHashConfig::default(), &[]).unwrap();
        assert!(function.is_empty());
        assert_eq!(function.index(&[0u8; 32]), 0);
    }
}
