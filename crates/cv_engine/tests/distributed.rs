// crates/cv_engine/tests/distributed.rs

//! 线程进程组上的全局归约

use cv_engine::prelude::*;
use cv_engine::{Communicator, Distributor, GlobalArrayReducer, ThreadComm};
use num_complex::Complex64;
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;

#[test]
fn test_volume_integral_across_ranks() {
    let basis = Arc::new(Basis::ball(1.0, [8, 6, 8], 1.5).unwrap());
    let f = Field::scalar("f", &basis).unwrap();
    f.set_grid_from_fn(|phi, theta, r| {
        let x = r * theta.sin() * phi.cos();
        vec![Complex64::new(r * r + x, 0.0)]
    })
    .unwrap();
    let serial = GlobalArrayReducer::new(Distributor::serial())
        .volume_integral(&f)
        .unwrap();
    // ∫ r² dV = 4π/5，x 项积分为零
    assert!((serial.re - 4.0 * PI / 5.0).abs() < 1e-10);
    assert!(serial.im.abs() < 1e-12);

    for size in [2, 3, 5] {
        let results: Vec<Complex64> = thread::scope(|s| {
            let handles: Vec<_> = ThreadComm::group(size)
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || {
                        let reducer = GlobalArrayReducer::new(Distributor::new(Arc::new(comm)));
                        reducer.volume_integral(f).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for v in results {
            assert!((v - serial).norm() < 1e-12, "{size} 个进程: {v}");
        }
    }
}

#[test]
fn test_local_grids_cover_phi() {
    let basis = Arc::new(Basis::sphere(1.0, 16, 8, 1.0).unwrap());
    let f = Field::scalar("f", &basis).unwrap();
    f.set_grid_from_fn(|phi, _, _| vec![Complex64::new(phi.cos(), 0.0)])
        .unwrap();
    let grid = f.grid_values().unwrap();

    let comms = ThreadComm::group(3);
    let total: usize = comms
        .into_iter()
        .map(|c| {
            let dist = Distributor::new(Arc::new(c));
            dist.distribute(&grid, 1).unwrap().len_of(ndarray::Axis(1))
        })
        .sum();
    assert_eq!(total, grid.len_of(ndarray::Axis(1)));
}

#[test]
fn test_reductions_agree_across_ranks() {
    let data: Vec<f64> = (0..20).map(|i| (i as f64 * 0.37).sin()).collect();
    let expected_sum: f64 = data.iter().sum();
    let expected_max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let results: Vec<(f64, f64, f64)> = thread::scope(|s| {
        let handles: Vec<_> = ThreadComm::group(4)
            .into_iter()
            .map(|comm| {
                let data = &data;
                s.spawn(move || {
                    let dist = Distributor::new(Arc::new(comm));
                    let local = &data[dist.local_range(data.len())];
                    let reducer = GlobalArrayReducer::new(dist.clone());
                    (
                        reducer.global_sum(local),
                        reducer.global_max(local),
                        reducer.global_mean(local),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (sum, max, mean) in results {
        assert!((sum - expected_sum).abs() < 1e-12);
        assert_eq!(max, expected_max);
        assert!((mean - expected_sum / 20.0).abs() < 1e-12);
    }
}

#[test]
fn test_self_comm_is_identity() {
    let comm = cv_engine::SelfComm;
    assert_eq!(comm.rank(), 0);
    assert_eq!(comm.size(), 1);
    assert_eq!(comm.reduce_sum(2.5), 2.5);
}
