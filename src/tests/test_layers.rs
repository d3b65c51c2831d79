//! Linear, LayerNorm, Embedding, Dropout and Block: forward values and
//! gradients checked against central differences.

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rstest::{fixture, rstest};

use crate::backend::MatmulBackend;
use crate::causalattention::{Block, CausalSelfAttention};
use crate::layers::{Dropout, Embedding, Layer, LayerNorm, Linear, Module, Parameter};
use crate::ops;
use crate::tensor::Tensor;

use super::{assert_grad_close, central_difference, project, rng, tiny_config};

const EPS: f32 = 1e-3;

#[fixture]
fn seeded() -> StdRng {
    crate::init();
    rng(1234)
}

/// Uniform in `[-scale, scale)`.
fn spread(shape: &[usize], scale: f32, rng: &mut StdRng) -> Tensor {
    let mut t = Tensor::rand(shape, rng);
    t.data_mut().iter_mut().for_each(|x| *x = (*x * 2.0 - 1.0) * scale);
    t
}

/// Upstream gradient of a mean over the output: uniform in `±1 / numel`.
fn upstream(shape: &[usize], rng: &mut StdRng) -> Tensor {
    let n: usize = shape.iter().product();
    spread(shape, 1.0 / n as f32, rng)
}

/// Checks `d project(layer(x)) / dx` for every input element.
fn check_input_grad<L: Layer>(layer: &mut L, x: &Tensor, proj: &Tensor, what: &str) {
    layer.zero_grad();
    let _ = layer.forward(x);
    let dx = layer.backward(proj);
    assert_eq!(dx.shape(), x.shape());

    let shape = x.shape().to_vec();
    let mut values = x.data().to_vec();
    for i in 0..values.len() {
        let fd = central_difference(&mut values, i, EPS, |v| {
            let xt = Tensor::from_vec(v.to_vec(), &shape).unwrap();
            project(&layer.forward(&xt), proj)
        });
        assert_grad_close(&format!("{what} dx[{i}]"), dx.data()[i], fd);
    }
}

/// Checks the accumulated gradient of parameter `pidx` for every element.
fn check_param_grad<L: Layer>(layer: &mut L, pidx: usize, x: &Tensor, proj: &Tensor) {
    layer.zero_grad();
    let _ = layer.forward(x);
    let _ = layer.backward(proj);
    let param: Parameter = layer.parameters()[pidx].clone();

    for i in 0..param.size() {
        let orig = param.value.data()[i];
        let plus = orig + EPS;
        let minus = orig - EPS;

        layer.parameters_mut()[pidx].value.data_mut()[i] = plus;
        let f_plus = project(&layer.forward(x), proj);
        layer.parameters_mut()[pidx].value.data_mut()[i] = minus;
        let f_minus = project(&layer.forward(x), proj);
        layer.parameters_mut()[pidx].value.data_mut()[i] = orig;

        let fd = (f_plus - f_minus) / (plus as f64 - minus as f64);
        assert_grad_close(&format!("{}[{i}]", param.name), param.grad.data()[i], fd);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Linear
// ─────────────────────────────────────────────────────────────────────────

#[rstest]
fn test_linear_init_and_names(mut seeded: StdRng) {
    let lin = Linear::new("proj", 4, 3, MatmulBackend::Naive, &mut seeded);
    assert_eq!(lin.weight.name, "proj.weight");
    assert_eq!(lin.bias.name, "proj.bias");
    assert_eq!(lin.weight.shape(), &[3, 4]);
    assert!(lin.bias.value.data().iter().all(|&b| b == 0.0));
    // (u - 0.5) / in_features
    assert!(lin.weight.value.data().iter().all(|&w| w.abs() <= 0.125));
    assert_eq!(lin.num_parameters(), 15);
}

#[rstest]
fn test_linear_forward_known_values(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 2, 2, MatmulBackend::Naive, &mut seeded);
    lin.weight.value = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    lin.bias.value = Tensor::from_vec(vec![0.5, -0.5], &[2]).unwrap();

    let x = Tensor::from_vec(vec![1.0, 1.0, 2.0, 0.0], &[2, 2]).unwrap();
    let y = lin.forward(&x);
    // row0: [1+2, 3+4] + b, row1: [2, 6] + b
    assert_eq!(y.data(), &[3.5, 6.5, 2.5, 5.5]);
}

#[rstest]
fn test_linear_keeps_leading_axes(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 4, 6, MatmulBackend::Naive, &mut seeded);
    let y = lin.forward(&Tensor::zeros(&[2, 3, 4]));
    assert_eq!(y.shape(), &[2, 3, 6]);
}

#[rstest]
fn test_linear_gradients(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 4, 3, MatmulBackend::Naive, &mut seeded);
    let x = spread(&[2, 3, 4], 1.0, &mut seeded);
    let proj = upstream(&[2, 3, 3], &mut seeded);

    check_input_grad(&mut lin, &x, &proj, "linear");
    check_param_grad(&mut lin, 0, &x, &proj);
    check_param_grad(&mut lin, 1, &x, &proj);
}

#[rstest]
#[should_panic(expected = "analytic")]
fn test_gradient_check_rejects_five_percent_error(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 4, 3, MatmulBackend::Naive, &mut seeded);
    let x = spread(&[2, 3, 4], 1.0, &mut seeded);
    let proj = upstream(&[2, 3, 3], &mut seeded);

    lin.zero_grad();
    let _ = lin.forward(&x);
    let _ = lin.backward(&proj);
    let grad = lin.weight.grad.clone();
    let mut values = lin.weight.value.data().to_vec();
    for i in 0..values.len() {
        let fd = central_difference(&mut values, i, EPS, |v| {
            lin.weight.value = Tensor::from_vec(v.to_vec(), &[3, 4]).unwrap();
            project(&lin.forward(&x), &proj)
        });
        assert_grad_close("scaled dW", grad.data()[i] * 1.05, fd);
    }
}

#[rstest]
fn test_linear_gradients_accumulate(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 3, 2, MatmulBackend::Naive, &mut seeded);
    let x = spread(&[4, 3], 1.0, &mut seeded);
    let g = Tensor::full(1.0, &[4, 2]);

    lin.forward(&x);
    lin.backward(&g);
    let once = lin.weight.grad.clone();
    lin.forward(&x);
    lin.backward(&g);
    for (a, b) in lin.weight.grad.data().iter().zip(once.data()) {
        assert_abs_diff_eq!(*a, 2.0 * b, epsilon = 1e-5);
    }

    lin.zero_grad();
    assert!(lin.weight.grad.data().iter().all(|&g| g == 0.0));
}

#[rstest]
#[should_panic(expected = "does not match weight")]
fn test_linear_width_mismatch_panics(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 4, 3, MatmulBackend::Naive, &mut seeded);
    lin.forward(&Tensor::zeros(&[2, 5]));
}

#[rstest]
#[should_panic(expected = "backward before forward")]
fn test_linear_backward_before_forward_panics(mut seeded: StdRng) {
    let mut lin = Linear::new("l", 4, 3, MatmulBackend::Naive, &mut seeded);
    lin.backward(&Tensor::zeros(&[1, 3]));
}

// ─────────────────────────────────────────────────────────────────────────
// LayerNorm
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_layernorm_known_row() {
    let mut ln = LayerNorm::new("ln", 4);
    let y = ln.forward(&Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 4]).unwrap());

    let expected0 = (1.0 - 2.5) / (1.25f32 + 1e-5).sqrt();
    assert_abs_diff_eq!(y.data()[0], expected0, epsilon = 1e-4);

    let mean: f32 = y.data().iter().sum::<f32>() / 4.0;
    let var: f32 = y.data().iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
    assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
    assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);

    let (means, rstds) = ln.cached_stats();
    assert_eq!(means, &[2.5]);
    assert_abs_diff_eq!(rstds[0], 1.0 / 1.25f32.sqrt(), epsilon = 1e-4);
}

#[test]
fn test_layernorm_constant_row_is_finite() {
    let mut ln = LayerNorm::new("ln", 3);
    let y = ln.forward(&Tensor::full(7.0, &[2, 3]));
    assert!(y.data().iter().all(|&v| v == 0.0));
}

#[rstest]
fn test_layernorm_gradients(mut seeded: StdRng) {
    let mut ln = LayerNorm::new("ln", 5);
    // Non-trivial affine parameters so dgamma and dx are both exercised.
    ln.gamma.value = spread(&[5], 1.5, &mut seeded);
    ln.beta.value = spread(&[5], 0.5, &mut seeded);
    let x = spread(&[2, 3, 5], 2.0, &mut seeded);
    let proj = upstream(&[2, 3, 5], &mut seeded);

    check_input_grad(&mut ln, &x, &proj, "layernorm");
    check_param_grad(&mut ln, 0, &x, &proj);
    check_param_grad(&mut ln, 1, &x, &proj);
}

// ─────────────────────────────────────────────────────────────────────────
// Embedding / Dropout
// ─────────────────────────────────────────────────────────────────────────

#[rstest]
fn test_embedding_gathers_rows(mut seeded: StdRng) {
    let mut emb = Embedding::new("wte", 5, 3, &mut seeded);
    assert!(emb.weight.value.data().iter().all(|&x| (0.0..1.0).contains(&x)));

    let out = emb.forward(&[4, 0, 4, 2], 2, 2);
    assert_eq!(out.shape(), &[2, 2, 3]);
    let table = emb.weight.value.data().to_vec();
    assert_eq!(&out.data()[0..3], &table[12..15]);
    assert_eq!(&out.data()[3..6], &table[0..3]);
    assert_eq!(&out.data()[9..12], &table[6..9]);
}

#[rstest]
fn test_embedding_repeated_indices_accumulate(mut seeded: StdRng) {
    let mut emb = Embedding::new("wte", 4, 2, &mut seeded);
    emb.forward(&[1, 3, 1], 1, 3);
    let g = Tensor::from_vec(vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0], &[1, 3, 2]).unwrap();
    emb.backward(&g);

    assert_eq!(emb.weight.grad.data(), &[0.0, 0.0, 101.0, 202.0, 0.0, 0.0, 10.0, 20.0]);
}

#[rstest]
#[should_panic(expected = "out of range")]
fn test_embedding_index_out_of_range_panics(mut seeded: StdRng) {
    let mut emb = Embedding::new("wte", 4, 2, &mut seeded);
    emb.forward(&[4], 1, 1);
}

#[rstest]
fn test_dropout_layer_modes(mut seeded: StdRng) {
    let x = spread(&[4, 8], 1.0, &mut seeded);

    let mut drop = Dropout::new(0.5);
    drop.set_training(false);
    assert_eq!(drop.forward(&x, &mut seeded), x);
    assert_eq!(drop.backward(&x), x);

    drop.set_training(true);
    let y = drop.forward(&x, &mut seeded);
    let g = drop.backward(&Tensor::full(1.0, x.shape()));
    // The backward mask is the forward mask.
    for ((&yi, &xi), &gi) in y.data().iter().zip(x.data()).zip(g.data()) {
        assert!(gi == 0.0 || gi == 2.0);
        assert_abs_diff_eq!(yi, xi * gi, epsilon = 1e-6);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Attention / Block
// ─────────────────────────────────────────────────────────────────────────

#[rstest]
fn test_attention_gradients(mut seeded: StdRng) {
    let cfg = tiny_config();
    let mut attn = CausalSelfAttention::new(&cfg, 0, MatmulBackend::Naive, &mut seeded);
    // Larger q/k/v projections give peaked attention rows.
    attn.c_attn.weight.value = ops::scale(&attn.c_attn.weight.value, 12.0);
    let x = spread(&[2, 4, cfg.n_embd], 1.0, &mut seeded);
    let proj = upstream(&[2, 4, cfg.n_embd], &mut seeded);

    check_input_grad(&mut attn, &x, &proj, "attention");
    for pidx in 0..attn.parameters().len() {
        check_param_grad(&mut attn, pidx, &x, &proj);
    }
}

#[rstest]
fn test_block_input_gradient(mut seeded: StdRng) {
    let cfg = tiny_config();
    let mut block = Block::new(&cfg, 0, MatmulBackend::Naive, &mut seeded);
    let x = spread(&[1, 5, cfg.n_embd], 1.0, &mut seeded);
    let proj = upstream(&[1, 5, cfg.n_embd], &mut seeded);

    block.zero_grad();
    let _ = block.forward(&x, &mut seeded);
    let dx = block.backward(&proj);

    let shape = x.shape().to_vec();
    let mut values = x.data().to_vec();
    for i in 0..values.len() {
        let fd = central_difference(&mut values, i, EPS, |v| {
            let xt = Tensor::from_vec(v.to_vec(), &shape).unwrap();
            project(&block.forward(&xt, &mut rng(0)), &proj)
        });
        assert_grad_close(&format!("block dx[{i}]"), dx.data()[i], fd);
    }
}

#[rstest]
fn test_block_parameter_names_and_order(mut seeded: StdRng) {
    let block = Block::new(&tiny_config(), 3, MatmulBackend::Naive, &mut seeded);
    let names: Vec<&str> = block.parameters().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "blocks.3.ln1.gamma",
            "blocks.3.ln1.beta",
            "blocks.3.attn.c_attn.weight",
            "blocks.3.attn.c_attn.bias",
            "blocks.3.attn.c_proj.weight",
            "blocks.3.attn.c_proj.bias",
            "blocks.3.ln2.gamma",
            "blocks.3.ln2.beta",
            "blocks.3.mlp.c_fc.weight",
            "blocks.3.mlp.c_fc.bias",
            "blocks.3.mlp.c_proj.weight",
            "blocks.3.mlp.c_proj.bias",
        ]
    );
}
