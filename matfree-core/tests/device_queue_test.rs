use approx::assert_relative_eq;
use matfree_core::{
    Communicator, ComputeDevice, CopyMode, CoreError, DeviceSettings, PlatformConfig, SelfComm,
    ThreadComm, ThreadModel,
};
use pollster::block_on;
use std::thread;

fn device(num_threads: usize) -> ComputeDevice {
    ComputeDevice::new(DeviceSettings {
        device_id: 0,
        num_threads,
    })
    .expect("Failed to create device")
}

fn random_vector(rng: &mut fastrand::Rng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.f64() * 2.0 - 1.0).collect()
}

#[test]
fn test_copy_issued_before_update_sees_old_value() -> Result<(), CoreError> {
    block_on(async {
        let device = device(2);
        let mut scalar = device.create_vector("scalar", &[1.0])?;
        let staging = device.host_alloc::<f64>("staging", 1);

        device
            .copy_to_host(&scalar.bind(), &staging, CopyMode::Async)
            .await?;
        let tag = device.tag_stream()?;
        device.fill(1, 42.0, &mut scalar)?;
        device.wait_for(tag).await?;

        // The copy was queued first, so it observed the value before the fill.
        assert_eq!(staging.get(0), Some(1.0));
        device.finish().await?;
        assert_eq!(scalar.read_contents().await?, vec![42.0]);
        Ok(())
    })
}

#[test]
fn test_serial_and_parallel_devices_agree() -> Result<(), CoreError> {
    block_on(async {
        let mut rng = fastrand::Rng::with_seed(7);
        let n = 10_000;
        let x_host = random_vector(&mut rng, n);
        let y_host = random_vector(&mut rng, n);

        let mut results = Vec::new();
        for model in [ThreadModel::Serial, ThreadModel::Parallel] {
            let config = PlatformConfig::new()
                .with_thread_model(model)
                .with_num_threads(4);
            let device = ComputeDevice::with_config(&config)?;
            let x = device.create_vector("x", &x_host)?;
            let mut y = device.create_vector("y", &y_host)?;
            device.axpy(n, 0.25, &x, -2.0, &mut y)?;
            results.push(device.inner_prod(n, &x, &y, &SelfComm).await?);
        }

        // Block partials are summed in block order on both.
        assert_eq!(results[0], results[1]);
        Ok(())
    })
}

#[test]
fn test_distributed_inner_product_matches_serial() {
    let mut rng = fastrand::Rng::with_seed(11);
    let n_per_rank = 3000;
    let ranks = 3;
    let x_host = random_vector(&mut rng, n_per_rank * ranks);
    let y_host = random_vector(&mut rng, n_per_rank * ranks);
    let expected: f64 = x_host.iter().zip(&y_host).map(|(a, b)| a * b).sum();

    let handles: Vec<_> = ThreadComm::group(ranks)
        .into_iter()
        .map(|comm| {
            let range = comm.rank() * n_per_rank..(comm.rank() + 1) * n_per_rank;
            let x_part = x_host[range.clone()].to_vec();
            let y_part = y_host[range].to_vec();
            thread::spawn(move || {
                block_on(async {
                    let device = device(2);
                    let x = device.create_vector("x", &x_part)?;
                    let y = device.create_vector("y", &y_part)?;
                    device.inner_prod(n_per_rank, &x, &y, &comm).await
                })
            })
        })
        .collect();

    let results: Vec<f64> = handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked").expect("inner product failed"))
        .collect();

    for value in &results {
        assert_eq!(*value, results[0]);
        assert_relative_eq!(*value, expected, epsilon = 1e-9);
    }
}

#[test]
fn test_device_lost_is_reported_to_readers() {
    block_on(async {
        let device = device(1);
        let v = device.create_vector("v", &[1.0, 2.0]).unwrap();
        let out = v.bind();
        device
            .launch("out_of_bounds", move |_| {
                let data = out.write();
                let _ = data[5];
            })
            .unwrap();

        let err = v.read_contents().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::DeviceLost(_) | CoreError::QueueDisconnected
        ));
    })
}
