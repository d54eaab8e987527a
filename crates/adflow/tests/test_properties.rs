//! Property tests over randomly shaped inputs.

use std::sync::LazyLock;

use adflow::{Runtime, RuntimeConfig, Tensor};
use approx::relative_eq;
use proptest::prelude::*;

static RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new(RuntimeConfig::default().with_num_threads(2)).unwrap());

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `(x shape, target shape, x data, y data)` where `x` broadcasts to the
/// target either along a new leading axis or along a size-1 axis.
fn broadcast_case() -> impl Strategy<Value = (Vec<usize>, Vec<usize>, Vec<f64>, Vec<f64>)> {
    (1usize..5, 1usize..5, any::<bool>()).prop_flat_map(|(m, n, leading)| {
        let (from, to) = if leading {
            (vec![n], vec![m, n])
        } else {
            (vec![m, 1], vec![m, n])
        };
        let x_len = from.iter().product::<usize>();
        let y_len = m * n;
        (
            Just(from),
            Just(to),
            prop::collection::vec(-10.0f64..10.0, x_len),
            prop::collection::vec(-10.0f64..10.0, y_len),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_sum_to_is_adjoint_of_broadcast((from, to, x, y) in broadcast_case()) {
        let rt = &*RUNTIME;
        let mut tape = rt.tape();
        let xv = tape.leaf(Tensor::from_vec(x.clone(), &from).unwrap(), false);
        let yv = tape.leaf(Tensor::from_vec(y.clone(), &to).unwrap(), false);
        let bx = tape.broadcast(&xv, &to).unwrap();
        let sy = tape.sum_to(&yv, &from).unwrap();
        let values = rt.evaluate(&mut tape, &[bx, sy]).unwrap();

        let lhs = dot(&values[0].to_f64_vec(), &y);
        let rhs = dot(&x, &values[1].to_f64_vec());
        prop_assert!(relative_eq!(lhs, rhs, epsilon = 1e-9, max_relative = 1e-12));
    }

    #[test]
    fn prop_add_passes_sensitivity_through(
        x in prop::collection::vec(-5.0f64..5.0, 1..16),
        seed in -3.0f64..3.0,
    ) {
        let rt = &*RUNTIME;
        let n = x.len();
        let mut tape = rt.tape();
        let a = tape.leaf(Tensor::from_vec(x.clone(), &[n]).unwrap(), true);
        let b = tape.leaf(Tensor::from_vec(x.iter().map(|v| v * 2.0).collect::<Vec<_>>(), &[n]).unwrap(), true);
        let c = tape.add(&a, &b).unwrap();
        let sens = Tensor::from_vec(vec![seed; n], &[n]).unwrap();

        let grads = rt.grad(&mut tape, &c, &[a, b], Some(sens)).unwrap();
        prop_assert_eq!(grads.get(0).unwrap().to_f64_vec(), vec![seed; n]);
        prop_assert_eq!(grads.get(1).unwrap().to_f64_vec(), vec![seed; n]);
    }

    #[test]
    fn prop_scale_gradient_is_alpha(
        x in prop::collection::vec(-5.0f64..5.0, 1..16),
        alpha in -4.0f64..4.0,
    ) {
        let rt = &*RUNTIME;
        let n = x.len();
        let mut tape = rt.tape();
        let a = tape.leaf(Tensor::from_vec(x, &[n]).unwrap(), true);
        let s = tape.scale(&a, alpha).unwrap();
        let loss = tape.sum(&s).unwrap();

        let grads = rt.grad(&mut tape, &loss, &[a], None).unwrap();
        prop_assert_eq!(grads.get(0).unwrap().to_f64_vec(), vec![alpha; n]);
    }
}
