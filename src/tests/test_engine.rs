//! Generation through the engine: lengths, context cropping and streaming.

use rstest::{fixture, rstest};

use crate::engine::Engine;
use crate::gpt::GptModel;
use crate::sampling::SamplingPolicy;
use crate::tensor::TokenIds;

use super::{rng, tiny_config};

#[fixture]
fn engine() -> Engine {
    crate::init();
    Engine::new(GptModel::new(&tiny_config(), &mut rng(21)).unwrap())
}

#[rstest]
fn test_new_switches_to_eval(engine: Engine) {
    assert!(!engine.model().is_training());
    assert_eq!(engine.block_size(), 8);
}

#[rstest]
fn test_crop_context(engine: Engine) {
    let ids: Vec<usize> = (0..11).collect();
    assert_eq!(engine.crop_context(&ids), &[3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(engine.crop_context(&ids[..3]), &[0, 1, 2]);
}

#[rstest]
fn test_prefill_and_next_logits_shapes(mut engine: Engine) {
    let ids = TokenIds::new(vec![1, 2, 3, 4, 5, 6], 2, 3).unwrap();
    let logits = engine.prefill(&ids, &mut rng(0));
    assert_eq!(logits.shape(), &[2, 3, 11]);
    let last = engine.next_logits(&ids, &mut rng(0));
    assert_eq!(last.shape(), &[2, 11]);
    assert_eq!(last.data()[..11], logits.data()[22..33]);
}

#[rstest]
#[case(SamplingPolicy::Greedy)]
#[case(SamplingPolicy::unfiltered())]
#[case(SamplingPolicy::top_k(3))]
#[case(SamplingPolicy::top_p(0.9))]
#[case(SamplingPolicy::temperature(0.7))]
fn test_generate_lengths_beyond_block_size(mut engine: Engine, #[case] policy: SamplingPolicy) {
    let out = engine.generate(&[1, 2], 20, policy, &mut rng(4));
    assert_eq!(out.len(), 22);
    assert_eq!(&out[..2], &[1, 2]);
    assert!(out.iter().all(|&id| id < 11));
}

#[rstest]
fn test_greedy_matches_model_generate(mut engine: Engine) {
    let via_engine = engine.generate(&[5, 3, 1], 10, SamplingPolicy::Greedy, &mut rng(0));
    let mut model = engine.into_model();
    let via_model = model.generate(&[5, 3, 1], 10, &mut rng(0));
    assert_eq!(via_engine, via_model);
}

#[rstest]
fn test_seeded_sampling_is_reproducible(mut engine: Engine) {
    let policy = SamplingPolicy::top_k(5);
    let a = engine.generate(&[7], 15, policy, &mut rng(8));
    let b = engine.generate(&[7], 15, policy, &mut rng(8));
    assert_eq!(a, b);
}

#[rstest]
fn test_stream_yields_exactly_max_new_tokens(mut engine: Engine) {
    let mut r = rng(2);
    let mut stream = engine.stream(&[4, 4], 6, SamplingPolicy::unfiltered(), &mut r);
    assert_eq!(stream.len(), 6);

    let first = stream.next().unwrap();
    assert_eq!(stream.len(), 5);
    assert_eq!(stream.ids(), &[4, 4, first]);

    let rest: Vec<usize> = stream.by_ref().collect();
    assert_eq!(rest.len(), 5);
    assert!(stream.next().is_none());
    assert_eq!(stream.ids().len(), 8);
}

#[rstest]
fn test_stream_with_zero_tokens(mut engine: Engine) {
    let mut r = rng(0);
    assert_eq!(engine.stream(&[1], 0, SamplingPolicy::Greedy, &mut r).count(), 0);
}

#[rstest]
fn test_generate_multi(mut engine: Engine) {
    let rows = engine.generate_multi(&[1, 2, 3], 4, 9, SamplingPolicy::unfiltered(), &mut rng(6));
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row.len(), 12);
        assert_eq!(&row[..3], &[1, 2, 3]);
    }

    // Greedy rows are identical to single-sequence greedy decoding.
    let greedy = engine.generate_multi(&[1, 2, 3], 2, 9, SamplingPolicy::Greedy, &mut rng(0));
    let single = engine.generate(&[1, 2, 3], 9, SamplingPolicy::Greedy, &mut rng(0));
    assert_eq!(greedy[0], single);
    assert_eq!(greedy[1], single);
}

#[rstest]
#[should_panic(expected = "prompt must be non-empty")]
fn test_empty_prompt_panics(mut engine: Engine) {
    engine.generate(&[], 3, SamplingPolicy::Greedy, &mut rng(0));
}
