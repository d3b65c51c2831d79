//! Tensor construction, views and token ids.

use crate::error::TensorError;
use crate::tensor::{Tensor, TokenIds};

use super::rng;

#[test]
fn test_constructors() {
    let z = Tensor::zeros(&[2, 3]);
    assert_eq!(z.shape(), &[2, 3]);
    assert_eq!(z.strides(), &[3, 1]);
    assert_eq!(z.size(), 6);
    assert!(z.data().iter().all(|&x| x == 0.0));

    let f = Tensor::full(2.5, &[4]);
    assert!(f.data().iter().all(|&x| x == 2.5));

    let r = Tensor::rand(&[3, 5], &mut rng(1));
    assert!(r.data().iter().all(|&x| (0.0..1.0).contains(&x)));
}

#[test]
fn test_rand_is_reproducible() {
    let a = Tensor::rand(&[16], &mut rng(7));
    let b = Tensor::rand(&[16], &mut rng(7));
    let c = Tensor::rand(&[16], &mut rng(8));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_from_vec_length_checked() {
    assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).is_ok());
    let err = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).unwrap_err();
    assert!(matches!(err, TensorError::DataLength { len: 3, .. }));
}

#[test]
fn test_strides_rank3() {
    let t = Tensor::zeros(&[2, 3, 4]);
    assert_eq!(t.strides(), &[12, 4, 1]);
    assert_eq!(t.rows(), 6);
    assert_eq!(t.last_dim(), 4);
}

#[test]
fn test_view_round_trip_is_bit_identical() {
    let t = Tensor::rand(&[2, 3, 4], &mut rng(3));
    let v = t.view(&[6, 4]).unwrap();
    assert_eq!(v.shape(), &[6, 4]);
    assert_eq!(v.strides(), &[4, 1]);
    let back = v.view(&[2, 3, 4]).unwrap().to_tensor();
    assert_eq!(back, t);
}

#[test]
fn test_view_size_mismatch_is_an_error() {
    let t = Tensor::zeros(&[2, 3]);
    let err = t.view(&[4, 2]).unwrap_err();
    match err {
        TensorError::ShapeMismatch {
            expected_size,
            got_size,
            ..
        } => {
            assert_eq!(expected_size, 6);
            assert_eq!(got_size, 8);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(Tensor::zeros(&[6]).reshape(&[5]).is_err());
}

#[test]
fn test_view_shares_the_buffer() {
    let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let v = t.view(&[4]).unwrap();
    assert_eq!(v.data().as_ptr(), t.data().as_ptr());
}

#[test]
fn test_view_mut_writes_are_visible() {
    let mut t = Tensor::zeros(&[2, 3]);
    {
        let mut v = t.view_mut(&[3, 2]).unwrap();
        v.set(&[2, 1], 9.0);
        v.data_mut()[0] = 1.0;
    }
    assert_eq!(t.data()[5], 9.0);
    assert_eq!(t.data()[0], 1.0);
    assert_eq!(t.shape(), &[2, 3]);
}

#[test]
fn test_clone_is_independent() {
    let t = Tensor::full(1.0, &[3]);
    let mut c = t.clone();
    c.data_mut()[0] = 5.0;
    assert_eq!(t.data()[0], 1.0);
}

#[test]
fn test_reshape_keeps_data() {
    let t = Tensor::from_vec((0..6).map(|x| x as f32).collect(), &[2, 3]).unwrap();
    let r = t.clone().reshape(&[3, 2]).unwrap();
    assert_eq!(r.data(), t.data());
    assert_eq!(r.row(2), &[4.0, 5.0]);
}

#[test]
fn test_token_ids() {
    let ids = TokenIds::new(vec![1, 2, 3, 4, 5, 6], 2, 3).unwrap();
    assert_eq!(ids.shape(), [2, 3]);
    assert_eq!(ids.max_id(), Some(6));
    assert!(TokenIds::new(vec![1, 2, 3], 2, 2).is_err());

    let seq = TokenIds::from_sequence(&[4, 5]);
    assert_eq!(seq.batch(), 1);
    assert_eq!(seq.time(), 2);
}
