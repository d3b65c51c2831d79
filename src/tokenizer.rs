//! Byte-level BPE tokenizer.
//!
//! Ids `0..256` are raw bytes; merge number `r` produces id `256 + r`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub const BYTE_VOCAB: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpeTokenizer {
    /// Merge rules in rank order.
    merges: Vec<(usize, usize)>,
    #[serde(skip)]
    ranks: HashMap<(usize, usize), usize>,
    #[serde(skip)]
    vocab: Vec<Vec<u8>>,
}

fn pair_counts(ids: &[usize]) -> HashMap<(usize, usize), usize> {
    let mut counts = HashMap::new();
    for w in ids.windows(2) {
        *counts.entry((w[0], w[1])).or_insert(0) += 1;
    }
    counts
}

/// Replaces every non-overlapping occurrence of `pair`, left to right.
fn merge_pair(ids: &[usize], pair: (usize, usize), new_id: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && (ids[i], ids[i + 1]) == pair {
            out.push(new_id);
            i += 2;
        } else {
            out.push(ids[i]);
            i += 1;
        }
    }
    out
}

impl Default for BpeTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BpeTokenizer {
    /// Byte-only tokenizer with no merges.
    pub fn new() -> Self {
        let mut tok = Self {
            merges: Vec::new(),
            ranks: HashMap::new(),
            vocab: Vec::new(),
        };
        tok.rebuild();
        tok
    }

    fn rebuild(&mut self) {
        self.vocab = (0..BYTE_VOCAB).map(|b| vec![b as u8]).collect();
        self.ranks.clear();
        for (rank, &(a, b)) in self.merges.iter().enumerate() {
            let mut bytes = self.vocab[a].clone();
            bytes.extend_from_slice(&self.vocab[b]);
            self.vocab.push(bytes);
            self.ranks.insert((a, b), rank);
        }
    }

    /// Learns up to `vocab_size - 256` merges from `text`. The most frequent
    /// adjacent pair wins; ties go to the smallest pair.
    pub fn train(text: &str, vocab_size: usize) -> Self {
        let mut tok = Self::new();
        let mut ids: Vec<usize> = text.bytes().map(usize::from).collect();
        let num_merges = vocab_size.saturating_sub(BYTE_VOCAB);

        for i in 0..num_merges {
            let counts = pair_counts(&ids);
            let Some((&pair, &count)) = counts
                .iter()
                .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then_with(|| pb.cmp(pa)))
            else {
                debug!("BPE: no pairs left after {} merges", i);
                break;
            };
            let new_id = BYTE_VOCAB + i;
            ids = merge_pair(&ids, pair, new_id);

            let mut bytes = tok.vocab[pair.0].clone();
            bytes.extend_from_slice(&tok.vocab[pair.1]);
            tok.vocab.push(bytes);
            tok.ranks.insert(pair, i);
            tok.merges.push(pair);
            debug!("BPE merge {}: {:?} -> {} (count {})", i, pair, new_id, count);
        }

        info!(
            "BPE trained: {} merges, vocab_size={}",
            tok.merges.len(),
            tok.vocab_size()
        );
        tok
    }

    pub fn vocab_size(&self) -> usize {
        BYTE_VOCAB + self.merges.len()
    }

    pub fn merges(&self) -> &[(usize, usize)] {
        &self.merges
    }

    /// Bytes of a single token, if the id exists.
    pub fn token_bytes(&self, id: usize) -> Option<&[u8]> {
        self.vocab.get(id).map(Vec::as_slice)
    }

    /// Applies the lowest-rank merge present until none applies.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        let mut ids: Vec<usize> = text.bytes().map(usize::from).collect();
        while ids.len() >= 2 {
            let best = ids
                .windows(2)
                .filter_map(|w| self.ranks.get(&(w[0], w[1])).map(|&r| (r, (w[0], w[1]))))
                .min();
            match best {
                Some((rank, pair)) => ids = merge_pair(&ids, pair, BYTE_VOCAB + rank),
                None => break,
            }
        }
        ids
    }

    /// Lossy UTF-8 decode. Unknown ids are skipped.
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            match self.vocab.get(id) {
                Some(tok) => bytes.extend_from_slice(tok),
                None => warn!("decode: unknown token id {}", id),
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self).context("Failed to serialize tokenizer")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write tokenizer file: {:?}", path))?;
        info!("Tokenizer saved to {:?}", path);
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokenizer file: {:?}", path))?;
        let mut tok: BpeTokenizer =
            serde_json::from_str(&json).context("Failed to deserialize tokenizer")?;
        for (rank, &(a, b)) in tok.merges.iter().enumerate() {
            anyhow::ensure!(
                a < BYTE_VOCAB + rank && b < BYTE_VOCAB + rank,
                "merge {} refers to a token that does not exist yet: ({}, {})",
                rank,
                a,
                b
            );
        }
        tok.rebuild();
        info!("Tokenizer loaded from {:?} (vocab_size={})", path, tok.vocab_size());
        Ok(tok)
    }
}

/// Incremental decoder for token-by-token output.
///
/// A single BPE token can end in the middle of a multi-byte character, so
/// bytes are held back until they complete valid UTF-8. Invalid sequences
/// come out as U+FFFD, the same as [`BpeTokenizer::decode`].
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` and returns whatever text is now complete.
    pub fn push(&mut self, tok: &BpeTokenizer, id: usize) -> String {
        match tok.token_bytes(id) {
            Some(bytes) => self.pending.extend_from_slice(bytes),
            None => warn!("decode: unknown token id {}", id),
        }

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete tail, wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Bytes still waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Flushes the held-back bytes, lossily.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
