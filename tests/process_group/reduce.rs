use muster::{ReduceOp, ReduceOptions};

use super::helpers::run_ranks;

#[test]
fn test_reduce_sum_to_root_0() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<f32> = if rank == 0 { vec![1.0, 2.0] } else { vec![10.0, 20.0] };
        let t = backend.tensor_from_slice(&values, &[2], 0).unwrap();
        let opts = ReduceOptions {
            reduce_op: ReduceOp::Sum,
            root_rank: 0,
            root_tensor: 0,
        };
        pg.reduce(std::slice::from_ref(&t), opts).unwrap().wait().unwrap();
        let out = backend.tensor_to_vec::<f32>(&t).unwrap();
        if rank == 0 {
            assert_eq!(out, vec![11.0, 22.0]);
        } else {
            // Only the root observes the reduction.
            assert_eq!(out, vec![10.0, 20.0]);
        }
    });
}

#[test]
fn test_reduce_max_to_root_1() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<i32> = if rank == 0 { vec![5, -2] } else { vec![3, 4] };
        let t = backend.tensor_from_slice(&values, &[2], 0).unwrap();
        let opts = ReduceOptions {
            reduce_op: ReduceOp::Max,
            root_rank: 1,
            root_tensor: 0,
        };
        pg.reduce(std::slice::from_ref(&t), opts).unwrap().wait().unwrap();
        if rank == 1 {
            assert_eq!(backend.tensor_to_vec::<i32>(&t).unwrap(), vec![5, 4]);
        }
    });
}
