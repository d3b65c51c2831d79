use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueHint};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use minigpt::{
    backend::{print_backend_info, MatmulBackend},
    checkpoint::load_checkpoint,
    config::{GptConfig, TrainConfig},
    dataset::TextDataset,
    engine::Engine,
    gpt::GptModel,
    ops,
    pretraining::Trainer,
    sampling::SamplingPolicy,
    tensor::Tensor,
    tokenizer::{BpeTokenizer, StreamDecoder},
};

const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Parser)]
#[command(author, version, about = "Train and sample a small GPT")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a tokenizer and a model on a text file
    Train(TrainArgs),
    /// Sample text from a checkpoint
    Generate(GenerateArgs),
    /// Time an NxN matmul
    Bench(BenchArgs),
    /// Train a tokenizer and report its compression
    Tokenize(TokenizeArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Training corpus
    #[arg(long, default_value = "data/input.txt", value_hint = ValueHint::FilePath)]
    text: PathBuf,
    /// Tokenizer vocabulary size (256 bytes + merges)
    #[arg(long, default_value_t = 1000)]
    vocab: usize,
    #[arg(long, default_value_t = 100)]
    steps: usize,
    #[arg(long = "batch", default_value_t = 8)]
    batch_size: usize,
    /// Context length
    #[arg(long = "block", default_value_t = 64)]
    block_size: usize,
    #[arg(long = "emb", default_value_t = 128)]
    n_embd: usize,
    #[arg(long = "layers", default_value_t = 2)]
    n_layer: usize,
    #[arg(long = "heads", default_value_t = 2)]
    n_head: usize,
    #[arg(long, default_value_t = 0.1)]
    dropout: f32,
    /// Peak learning rate
    #[arg(long, default_value_t = 1e-3)]
    lr: f32,
    #[arg(long = "lr-min", default_value_t = 1e-4)]
    lr_min: f32,
    #[arg(long = "warmup", default_value_t = 10)]
    warmup_steps: usize,
    /// 0 disables clipping
    #[arg(long = "max-grad-norm", default_value_t = 1.0)]
    max_grad_norm: f32,
    #[arg(long = "weight-decay", default_value_t = 0.01)]
    weight_decay: f32,
    /// Save a checkpoint every N steps (0 = only at the end)
    #[arg(long = "ckpt-interval", default_value_t = 100)]
    checkpoint_interval: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long = "out", default_value = "checkpoints", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,
    /// JSON training config; replaces the optimisation flags above
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "naive")]
    backend: MatmulBackend,
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, default_value = "Hello")]
    prompt: String,
    /// Number of tokens to generate
    #[arg(long, default_value_t = 50)]
    tokens: usize,
    #[arg(long = "ckpt", default_value = "checkpoints", value_hint = ValueHint::DirPath)]
    checkpoint: PathBuf,
    /// 0 selects greedy decoding
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
    /// 0 disables top-k
    #[arg(long = "top-k", default_value_t = 0)]
    top_k: usize,
    /// 1.0 disables top-p
    #[arg(long = "top-p", default_value_t = 1.0)]
    top_p: f32,
    /// Fixed seed; random when omitted
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct BenchArgs {
    /// Matrix size N
    #[arg(long, default_value_t = 256)]
    size: usize,
    #[arg(long = "iter", default_value_t = 10)]
    iterations: usize,
    #[arg(long, default_value = "naive")]
    backend: MatmulBackend,
}

#[derive(Args)]
struct TokenizeArgs {
    #[arg(long, default_value = "data/input.txt", value_hint = ValueHint::FilePath)]
    text: PathBuf,
    #[arg(long, default_value_t = 1000)]
    vocab: usize,
    /// Where to write the tokenizer JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Generate(args) => generate(args),
        Command::Bench(args) => bench(args),
        Command::Tokenize(args) => tokenize(args),
    }
}

fn read_corpus(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read corpus: {:?}", path))
}

fn train(args: TrainArgs) -> Result<()> {
    print_backend_info(args.backend);
    let text = read_corpus(&args.text)?;

    info!("Training tokenizer (vocab={})...", args.vocab);
    let tok = BpeTokenizer::train(&text, args.vocab);
    let ids = tok.encode(&text);
    info!("Encoded {} bytes to {} tokens", text.len(), ids.len());

    let mut train_cfg = match &args.config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig {
            steps: args.steps,
            batch_size: args.batch_size,
            learning_rate: args.lr,
            min_learning_rate: args.lr_min,
            warmup_steps: args.warmup_steps,
            weight_decay: args.weight_decay,
            max_grad_norm: args.max_grad_norm,
            checkpoint_interval: args.checkpoint_interval,
            seed: args.seed,
            out_dir: None,
        },
    };
    let out_dir = train_cfg
        .out_dir
        .get_or_insert_with(|| args.out_dir.clone())
        .clone();

    let dataset = TextDataset::new(ids, args.block_size)?;
    let model_cfg = GptConfig {
        vocab_size: tok.vocab_size(),
        block_size: args.block_size,
        n_layer: args.n_layer,
        n_head: args.n_head,
        n_embd: args.n_embd,
        dropout: args.dropout,
    };

    let mut rng = StdRng::seed_from_u64(train_cfg.seed);
    let model = GptModel::with_backend(&model_cfg, args.backend, &mut rng)?;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", out_dir))?;
    tok.save(out_dir.join(TOKENIZER_FILE))?;

    let mut trainer = Trainer::new(model, train_cfg)?;
    let history = trainer.fit(&dataset, &mut rng)?;
    if let (Some(first), Some(last)) = (history.first(), history.last()) {
        info!(
            "Training complete: loss {:.4} -> {:.4} over {} steps",
            first.loss,
            last.loss,
            history.len()
        );
    }
    Ok(())
}

fn generate(args: GenerateArgs) -> Result<()> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let tok = BpeTokenizer::load(args.checkpoint.join(TOKENIZER_FILE))?;
    let (model, meta, report) = load_checkpoint(&args.checkpoint, &mut rng)?;
    info!("Loaded config from checkpoint: {:?}", meta.config);
    if !report.is_complete() {
        log::warn!(
            "Partial restore: skipped={:?} missing={:?}",
            report.skipped,
            report.missing
        );
    }

    let policy = SamplingPolicy::from_settings(args.temperature, args.top_k, args.top_p)
        .context("Invalid sampling settings")?;

    let prompt = tok.encode(&args.prompt);
    anyhow::ensure!(!prompt.is_empty(), "prompt encodes to zero tokens");

    let mut engine = Engine::new(model);
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{}", args.prompt)?;
    let mut decoder = StreamDecoder::new();
    for id in engine.stream(&prompt, args.tokens, policy, &mut rng) {
        write!(stdout, "{}", decoder.push(&tok, id))?;
        stdout.flush()?;
    }
    writeln!(stdout, "{}", decoder.finish())?;
    Ok(())
}

fn bench(args: BenchArgs) -> Result<()> {
    print_backend_info(args.backend);
    let n = args.size;
    anyhow::ensure!(args.iterations > 0, "need at least one iteration");
    println!(
        "Benchmarking MatMul {}x{} for {} iters ({})...",
        n,
        n,
        args.iterations,
        args.backend.name()
    );

    let mut rng = StdRng::seed_from_u64(0);
    let a = Tensor::rand(&[n, n], &mut rng);
    let b = Tensor::rand(&[n, n], &mut rng);

    let start = Instant::now();
    for _ in 0..args.iterations {
        let _ = ops::matmul_with(args.backend, &a, &b);
    }
    let dur = start.elapsed();

    let flops = 2.0 * (n as f64).powi(3) * args.iterations as f64;
    println!("Total time: {:?}", dur);
    println!("Avg time: {:?}", dur / args.iterations as u32);
    println!("GFLOPS: {:.4}", flops / dur.as_secs_f64() / 1e9);
    Ok(())
}

fn tokenize(args: TokenizeArgs) -> Result<()> {
    let text = read_corpus(&args.text)?;
    let start = Instant::now();
    let tok = BpeTokenizer::train(&text, args.vocab);
    let ids = tok.encode(&text);

    println!("Vocab size: {}", tok.vocab_size());
    println!("Bytes: {}  Tokens: {}", text.len(), ids.len());
    if !ids.is_empty() {
        println!("Compression: {:.2} bytes/token", text.len() as f64 / ids.len() as f64);
    }
    println!("Round trip exact: {}", tok.decode(&ids) == text);
    println!("Elapsed: {:?}", start.elapsed());

    if let Some(out) = &args.out {
        tok.save(out)?;
    }
    Ok(())
}
