use muster::{AllreduceOptions, ReduceOp};

use super::helpers::run_ranks;

#[test]
fn test_allreduce_sum_f32_2_ranks() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<f32> = if rank == 0 {
            vec![1.0, 2.0, 3.0]
        } else {
            vec![4.0, 5.0, 6.0]
        };
        let t = backend.tensor_from_slice(&values, &[3], 0).unwrap();
        let work = pg
            .allreduce(std::slice::from_ref(&t), AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap();
        assert!(work.is_success().unwrap());
        assert_eq!(
            backend.tensor_to_vec::<f32>(&t).unwrap(),
            vec![5.0, 7.0, 9.0],
            "rank {rank} observed a wrong sum"
        );
    });
}

#[test]
fn test_two_sequential_allreduces_square_the_world_size() {
    // Every rank holds 1; after one sum each holds n, after another n².
    let n = 3usize;
    run_ranks(n, 1, move |rank, pg, backend| {
        let t = backend.tensor_from_slice(&[1.0f64; 4], &[4], 0).unwrap();
        for expected in [n as f64, (n * n) as f64] {
            pg.allreduce(std::slice::from_ref(&t), AllreduceOptions::default())
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(
                backend.tensor_to_vec::<f64>(&t).unwrap(),
                vec![expected; 4],
                "rank {rank} after allreduce expected {expected}"
            );
        }
    });
}

#[test]
fn test_allreduce_min_max_prod() {
    run_ranks(2, 1, |rank, pg, backend| {
        let ops = [
            (ReduceOp::Min, vec![1i32, -4]),
            (ReduceOp::Max, vec![2, 3]),
            (ReduceOp::Prod, vec![2, -12]),
        ];
        for (op, expected) in ops {
            let values: Vec<i32> = if rank == 0 { vec![1, 3] } else { vec![2, -4] };
            let t = backend.tensor_from_slice(&values, &[2], 0).unwrap();
            pg.allreduce(std::slice::from_ref(&t), AllreduceOptions { reduce_op: op })
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(
                backend.tensor_to_vec::<i32>(&t).unwrap(),
                expected,
                "rank {rank} failed {op}"
            );
        }
    });
}

#[test]
fn test_allreduce_i64() {
    run_ranks(2, 1, |rank, pg, backend| {
        let t = backend
            .tensor_from_slice(&[(rank as i64 + 1) << 40], &[1], 0)
            .unwrap();
        pg.allreduce(std::slice::from_ref(&t), AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(backend.tensor_to_vec::<i64>(&t).unwrap(), vec![3 << 40]);
    });
}

#[test]
fn test_allreduce_two_devices_per_rank() {
    // 2 ranks × 2 devices: four global participants sum 1+2+3+4.
    run_ranks(2, 2, |rank, pg, backend| {
        let tensors = vec![
            backend
                .tensor_from_slice(&[(rank * 2 + 1) as f32], &[1], 0)
                .unwrap(),
            backend
                .tensor_from_slice(&[(rank * 2 + 2) as f32], &[1], 1)
                .unwrap(),
        ];
        pg.allreduce(&tensors, AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        for t in &tensors {
            assert_eq!(backend.tensor_to_vec::<f32>(t).unwrap(), vec![10.0]);
        }
    });
}

#[test]
fn test_allreduce_rejects_empty_list() {
    run_ranks(1, 1, |_rank, pg, _backend| {
        let err = pg.allreduce(&[], AllreduceOptions::default()).unwrap_err();
        assert!(matches!(err, muster::MusterError::InvalidArgument(_)));
    });
}
