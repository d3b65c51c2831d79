use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use minigpt::{
    backend::{print_backend_info, MatmulBackend},
    checkpoint::load_checkpoint,
    config::{GptConfig, TrainConfig},
    dataset::TextDataset,
    engine::Engine,
    gpt::GptModel,
    layers::Module,
    pretraining::Trainer,
    sampling::SamplingPolicy,
    tokenizer::BpeTokenizer,
};

const CORPUS: &str = "the quick brown fox jumps over the lazy dog. \
the lazy dog sleeps while the quick brown fox runs. \
a quick brown dog jumps over a lazy fox. ";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let backend = MatmulBackend::Parallel;
    print_backend_info(backend);

    // ═════════════════════════════════════════════════════════════════════════
    // Tokenizer + dataset
    // ═════════════════════════════════════════════════════════════════════════
    let text = CORPUS.repeat(20);
    let tok = BpeTokenizer::train(&text, 300);
    let ids = tok.encode(&text);
    println!(
        "Tokenizer: vocab={} | {} bytes -> {} tokens",
        tok.vocab_size(),
        text.len(),
        ids.len()
    );

    let block_size = 16;
    let dataset = TextDataset::new(ids, block_size)?;

    // ═════════════════════════════════════════════════════════════════════════
    // Model + training
    // ═════════════════════════════════════════════════════════════════════════
    let cfg = GptConfig {
        vocab_size: tok.vocab_size(),
        block_size,
        n_layer: 2,
        n_head: 2,
        n_embd: 32,
        dropout: 0.0,
    };
    let mut rng = StdRng::seed_from_u64(7);
    let model = GptModel::with_backend(&cfg, backend, &mut rng)?;
    println!("Model: {} parameters", model.num_parameters());

    let ckpt = TempDir::new()?;
    let train_cfg = TrainConfig {
        steps: 60,
        batch_size: 4,
        learning_rate: 3e-3,
        min_learning_rate: 3e-4,
        warmup_steps: 5,
        checkpoint_interval: 30,
        out_dir: Some(ckpt.path().to_path_buf()),
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(model, train_cfg)?;
    let history = trainer.fit(&dataset, &mut rng)?;
    if let (Some(first), Some(last)) = (history.first(), history.last()) {
        println!("Loss: {:.4} -> {:.4}", first.loss, last.loss);
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Reload + sample
    // ═════════════════════════════════════════════════════════════════════════
    let (model, meta, report) = load_checkpoint(ckpt.path(), &mut rng)?;
    println!(
        "Reloaded step {} (loss {:.4}), complete={}",
        meta.step,
        meta.loss,
        report.is_complete()
    );

    let mut engine = Engine::new(model);
    let prompt = tok.encode("the quick");
    for (label, policy) in [
        ("greedy", SamplingPolicy::Greedy),
        ("top-k 5", SamplingPolicy::top_k(5)),
        ("top-p 0.9", SamplingPolicy::top_p(0.9)),
    ] {
        let out = engine.generate(&prompt, 24, policy, &mut rng);
        println!("[{label}] {}", tok.decode(&out));
    }
    Ok(())
}
