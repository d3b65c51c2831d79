//! Byte-level BPE: training order, encoding, decoding and persistence.

use rstest::rstest;
use tempfile::TempDir;

use crate::tokenizer::{BpeTokenizer, StreamDecoder, BYTE_VOCAB};

#[test]
fn test_known_merges() {
    crate::init();
    let tok = BpeTokenizer::train("aaabdaaabac", 259);
    assert_eq!(tok.merges(), &[(97, 97), (97, 98), (256, 257)]);
    assert_eq!(tok.vocab_size(), 259);
    assert_eq!(tok.token_bytes(258), Some(&b"aaab"[..]));
}

#[test]
fn test_encode_uses_all_merges() {
    let tok = BpeTokenizer::train("aaabdaaabac", 259);
    assert_eq!(tok.encode("aaab"), vec![258]);
    assert_eq!(tok.encode("aaabdaaabac"), vec![258, 100, 258, 97, 99]);
}

#[test]
fn test_training_stops_when_no_pairs_remain() {
    let tok = BpeTokenizer::train("ab", 300);
    assert_eq!(tok.merges(), &[(97, 98)]);
    assert_eq!(tok.vocab_size(), BYTE_VOCAB + 1);
}

#[test]
fn test_byte_only_tokenizer() {
    let tok = BpeTokenizer::new();
    assert_eq!(tok.vocab_size(), 256);
    assert_eq!(tok.encode("hi"), vec![104, 105]);
    assert_eq!(BpeTokenizer::default().vocab_size(), 256);
    assert!(BpeTokenizer::train("", 300).merges().is_empty());
}

#[rstest]
#[case("hello world, hello there")]
#[case("naïve café ☕ 日本語")]
#[case("")]
#[case("a")]
fn test_round_trip(#[case] text: &str) {
    let corpus = "hello world, hello there. naïve café ☕ 日本語 日本語";
    let tok = BpeTokenizer::train(corpus, 300);
    assert_eq!(tok.decode(&tok.encode(text)), text);
}

#[test]
fn test_encoding_compresses_training_text() {
    let text = "the cat sat on the mat. the cat sat on the hat. ".repeat(4);
    let tok = BpeTokenizer::train(&text, 280);
    let ids = tok.encode(&text);
    assert!(ids.len() < text.len() / 2);
    assert!(ids.iter().all(|&id| id < tok.vocab_size()));
}

#[test]
fn test_decode_skips_unknown_ids() {
    let tok = BpeTokenizer::new();
    assert_eq!(tok.decode(&[104, 9999, 105]), "hi");
}

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokenizer.json");
    let tok = BpeTokenizer::train("abababcabcabcd", 262);
    tok.save(&path).unwrap();

    let loaded = BpeTokenizer::load(&path).unwrap();
    assert_eq!(loaded.merges(), tok.merges());
    assert_eq!(loaded.vocab_size(), tok.vocab_size());
    assert_eq!(loaded.encode("abcabcd"), tok.encode("abcabcd"));
    assert_eq!(loaded.token_bytes(257), tok.token_bytes(257));
}

#[test]
fn test_load_rejects_forward_references() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{"merges": [[97, 300]]}"#).unwrap();
    assert!(BpeTokenizer::load(&path).is_err());
}

#[test]
fn test_stream_decoder_holds_split_characters() {
    let tok = BpeTokenizer::new();
    let mut dec = StreamDecoder::new();
    // "é" is 0xC3 0xA9
    assert_eq!(dec.push(&tok, 0xC3), "");
    assert_eq!(dec.pending(), &[0xC3]);
    assert_eq!(dec.push(&tok, 0xA9), "é");
    assert!(dec.pending().is_empty());
    assert_eq!(dec.push(&tok, b'a' as usize), "a");
}

#[test]
fn test_stream_decoder_matches_decode() {
    let text = "naïve café, 日本語 ✓";
    let tok = BpeTokenizer::train(text, 270);
    let ids = tok.encode(text);

    let mut dec = StreamDecoder::new();
    let mut streamed: String = ids.iter().map(|&id| dec.push(&tok, id)).collect();
    streamed.push_str(&dec.finish());
    assert_eq!(streamed, text);
    assert_eq!(streamed, tok.decode(&ids));
}

#[rstest]
#[case(&[0xFF], "\u{FFFD}", "")]
#[case(&[b'a', 0xFF, b'b'], "a\u{FFFD}b", "")]
#[case(&[0xE6, 0x97], "", "\u{FFFD}")]
#[case(&[0xC3, b'x'], "\u{FFFD}x", "")]
fn test_stream_decoder_invalid_bytes(
    #[case] ids: &[u8],
    #[case] streamed: &str,
    #[case] flushed: &str,
) {
    let tok = BpeTokenizer::new();
    let mut dec = StreamDecoder::new();
    let out: String = ids.iter().map(|&b| dec.push(&tok, b as usize)).collect();
    assert_eq!(out, streamed);
    assert_eq!(dec.finish(), flushed);
    assert!(dec.pending().is_empty());
}
