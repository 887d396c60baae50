//! Byte-pair tokenizer over a binary vocabulary file.
//!
//! File layout (little-endian): `magic: u32`, `vocab_size: u32`,
//! `max_token_len: u32`, `bos_id: u32`, `eos_id: u32`, then per token
//! `{score: f32, len: u32, bytes}`. Encoding seeds one token per
//! character (byte fallback tokens `<0xHH>` cover the rest) and
//! greedily merges the best-scoring adjacent pair.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const TOKENIZER_MAGIC: u32 = 0x544B_5A4C;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid tokenizer magic: 0x{0:08X}")]
    BadMagic(u32),

    #[error("Tokenizer file truncated")]
    Truncated,
}

pub struct Tokenizer {
    vocab: Vec<String>,
    scores: Vec<f32>,
    index: HashMap<String, u32>,
    pub vocab_size: u32,
    pub max_token_len: u32,
    pub bos_id: u32,
    pub eos_id: u32,
    prev_token: Option<u32>,
}

impl Tokenizer {
    pub fn load(path: &Path) -> Result<Self, TokenizerError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        if bytes.len() < 20 {
            return Err(TokenizerError::Truncated);
        }
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != TOKENIZER_MAGIC {
            return Err(TokenizerError::BadMagic(magic));
        }
        let vocab_size = LittleEndian::read_u32(&bytes[4..8]);
        let max_token_len = LittleEndian::read_u32(&bytes[8..12]);
        let bos_id = LittleEndian::read_u32(&bytes[12..16]);
        let eos_id = LittleEndian::read_u32(&bytes[16..20]);

        let mut vocab = Vec::with_capacity(vocab_size as usize);
        let mut scores = Vec::with_capacity(vocab_size as usize);
        let mut pos = 20usize;
        for _ in 0..vocab_size {
            if pos + 8 > bytes.len() {
                return Err(TokenizerError::Truncated);
            }
            let score = LittleEndian::read_f32(&bytes[pos..pos + 4]);
            let len = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]) as usize;
            pos += 8;
            if pos + len > bytes.len() {
                return Err(TokenizerError::Truncated);
            }
            let piece = String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned();
            pos += len;
            scores.push(score);
            vocab.push(piece);
        }

        let index = vocab
            .iter()
            .enumerate()
            .map(|(i, piece)| (piece.clone(), i as u32))
            .collect();

        Ok(Tokenizer {
            vocab,
            scores,
            index,
            vocab_size,
            max_token_len,
            bos_id,
            eos_id,
            prev_token: None,
        })
    }

    fn lookup(&self, piece: &str) -> Option<u32> {
        self.index.get(piece).copied()
    }

    /// Encodes text to token ids, optionally wrapping with BOS/EOS.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<u32> {
        let mut tokens: Vec<u32> = Vec::new();
        if bos {
            tokens.push(self.bos_id);
        }

        // Seed: one token per character, byte fallback otherwise.
        let mut pieces: Vec<u32> = Vec::new();
        for ch in text.chars() {
            let s = ch.to_string();
            if let Some(id) = self.lookup(&s) {
                pieces.push(id);
            } else {
                let mut buf = [0u8; 4];
                for &byte in ch.encode_utf8(&mut buf).as_bytes() {
                    if let Some(id) = self.lookup(&format!("<0x{byte:02X}>")) {
                        pieces.push(id);
                    }
                }
            }
        }

        // Greedy merge: always take the best-scoring adjacent pair.
        loop {
            let mut best: Option<(usize, u32, f32)> = None;
            for i in 0..pieces.len().saturating_sub(1) {
                let merged = format!(
                    "{}{}",
                    self.vocab[pieces[i] as usize],
                    self.vocab[pieces[i + 1] as usize]
                );
                if let Some(id) = self.lookup(&merged) {
                    let score = self.scores[id as usize];
                    if best.map_or(true, |(_, _, s)| score > s) {
                        best = Some((i, id, score));
                    }
                }
            }
            let Some((at, id, _)) = best else {
                break;
            };
            pieces[at] = id;
            pieces.remove(at + 1);
        }

        tokens.extend(pieces);
        if eos {
            tokens.push(self.eos_id);
        }
        tokens
    }

    /// Decodes one token, tracking the previous one so a leading space
    /// marker after BOS is stripped the way sentencepiece renders.
    pub fn decode(&mut self, token: u32) -> String {
        let piece = self.vocab.get(token as usize).cloned().unwrap_or_default();
        let mut text = if let Some(byte) = parse_byte_token(&piece) {
            (byte as char).to_string()
        } else {
            piece.replace('\u{2581}', " ")
        };
        if self.prev_token.is_none() || self.prev_token == Some(self.bos_id) {
            text = text.trim_start().to_string();
        }
        self.prev_token = Some(token);
        text
    }

    pub fn reset_decoder(&mut self) {
        self.prev_token = None;
    }

    pub fn piece(&self, token: u32) -> Option<&str> {
        self.vocab.get(token as usize).map(String::as_str)
    }
}

fn parse_byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

/// Helper for tests and tooling: serializes a vocabulary.
pub fn encode_tokenizer(vocab: &[(&str, f32)], bos_id: u32, eos_id: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&TOKENIZER_MAGIC.to_le_bytes());
    out.extend_from_slice(&(vocab.len() as u32).to_le_bytes());
    let max_len = vocab.iter().map(|(s, _)| s.len() as u32).max().unwrap_or(0);
    out.extend_from_slice(&max_len.to_le_bytes());
    out.extend_from_slice(&bos_id.to_le_bytes());
    out.extend_from_slice(&eos_id.to_le_bytes());
    for (piece, score) in vocab {
        out.extend_from_slice(&score.to_le_bytes());
        out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
        out.extend_from_slice(piece.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_tokenizer() -> Tokenizer {
        let vocab: Vec<(&str, f32)> = vec![
            ("<s>", 0.0),
            ("</s>", 0.0),
            ("h", -10.0),
            ("e", -10.0),
            ("l", -10.0),
            ("o", -10.0),
            ("he", -1.0),
            ("ll", -2.0),
            ("hello", -0.5),
            ("hell", -0.8),
        ];
        let bytes = encode_tokenizer(&vocab, 0, 1);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        Tokenizer::load(file.path()).unwrap()
    }

    #[test]
    fn test_greedy_merge_prefers_best_score() {
        let tok = test_tokenizer();
        let ids = tok.encode("hello", true, false);
        // BOS then a fully merged "hello".
        assert_eq!(ids[0], 0);
        assert_eq!(ids[1..], [8]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut tok = test_tokenizer();
        let ids = tok.encode("hello", false, false);
        let text: String = ids.iter().map(|&t| tok.decode(t)).collect();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_bad_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 32]).unwrap();
        file.flush().unwrap();
        assert!(matches!(
            Tokenizer::load(file.path()),
            Err(TokenizerError::BadMagic(_))
        ));
    }
}
