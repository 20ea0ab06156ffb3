use anyhow::Result;
use nnrt::backend::{BackendError, Kernel, KernelContext};
use nnrt::ir::{LossKind, OperationIndex};
use nnrt::HostTensor;
use nnrt_backend_ref_cpu::kernels::loss::{
    categorical_cross_entropy, cce_grad, mse, mse_grad, LossKernel,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BATCH: usize = 3;
const SIZE: usize = 4;

fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn batch_loss(pred: &[f32], target: &[f32]) -> f32 {
    mse(pred, target, BATCH).iter().sum()
}

#[test]
fn mse_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let pred = random_values(&mut rng, BATCH * SIZE);
        let target = random_values(&mut rng, BATCH * SIZE);
        let analytic = mse_grad(&pred, &target, SIZE);

        let h = 1e-2f32;
        for i in 0..pred.len() {
            let mut plus = pred.clone();
            let mut minus = pred.clone();
            plus[i] += h;
            minus[i] -= h;
            let numeric = (batch_loss(&plus, &target) - batch_loss(&minus, &target)) / (2.0 * h);
            assert!(
                (numeric - analytic[i]).abs() < 1e-3,
                "element {i}: numeric {numeric} vs analytic {}",
                analytic[i]
            );
        }
    }
}

#[test]
fn loss_kernel_backward_scales_by_seed() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let pred = HostTensor::from_f32(&[BATCH, SIZE], random_values(&mut rng, BATCH * SIZE))?;
    let target = HostTensor::from_f32(&[BATCH, SIZE], random_values(&mut rng, BATCH * SIZE))?;
    let kernel = LossKernel {
        kind: LossKind::MeanSquaredError,
    };
    let cx = KernelContext::new(OperationIndex::new(0), None);

    let out = kernel.run(&[&pred, &target], &cx)?;
    assert_eq!(out[0].dims(), &[BATCH]);

    let seed = HostTensor::filled(&[BATCH], 0.5);
    let grads = kernel.backward(&[&pred, &target], &[&out[0]], &[&seed], &cx)?;
    assert!(grads[1].is_none());
    let grad = grads[0].as_ref().map(|g| g.as_f32().unwrap_or_default().to_vec());
    let expected: Vec<f32> = mse_grad(pred.as_f32().unwrap(), target.as_f32().unwrap(), SIZE)
        .into_iter()
        .map(|g| g * 0.5)
        .collect();
    assert_eq!(grad, Some(expected));
    Ok(())
}

#[test]
fn cross_entropy_rejects_out_of_range_predictions() {
    let kernel = LossKernel {
        kind: LossKind::CategoricalCrossEntropy,
    };
    let pred = HostTensor::from_f32(&[1, 3], vec![0.2, 1.3, -0.5]).unwrap();
    let target = HostTensor::from_f32(&[1, 3], vec![0.0, 1.0, 0.0]).unwrap();
    let cx = KernelContext::new(OperationIndex::new(0), None);
    let err = kernel.run(&[&pred, &target], &cx).unwrap_err();
    assert!(matches!(err, BackendError::InvalidInput(_)));
    assert!(matches!(
        nnrt::Error::from(err),
        nnrt::Error::InvalidInput(_)
    ));
}

#[test]
fn cross_entropy_gradient_is_negative_ratio() {
    let pred = [0.25f32, 0.5, 0.0, 1.0];
    let target = [1.0f32, 0.0, 1.0, 0.5];
    let grad = cce_grad(&pred, &target).unwrap();
    let expected: Vec<f32> = pred
        .iter()
        .zip(&target)
        .map(|(p, t)| -(t / p.max(1e-20)))
        .collect();
    assert_eq!(grad, expected);
    assert_eq!(grad[0], -4.0);
    assert!(grad[2] < -1e19);

    let loss = categorical_cross_entropy(&pred, &target, 2).unwrap();
    assert!(loss.is_finite());
}
