use muster::BroadcastOptions;

use super::helpers::run_ranks;

#[test]
fn test_broadcast_from_root_1() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<f32> = if rank == 1 {
            vec![9.0, 8.0, 7.0, 6.0]
        } else {
            vec![0.0; 4]
        };
        let t = backend.tensor_from_slice(&values, &[4], 0).unwrap();
        let opts = BroadcastOptions {
            root_rank: 1,
            root_tensor: 0,
        };
        pg.broadcast(std::slice::from_ref(&t), opts).unwrap().wait().unwrap();
        assert_eq!(
            backend.tensor_to_vec::<f32>(&t).unwrap(),
            vec![9.0, 8.0, 7.0, 6.0],
            "rank {rank} did not receive the root's data"
        );
    });
}

#[test]
fn test_broadcast_from_root_0_i64() {
    run_ranks(3, 1, |rank, pg, backend| {
        let values: Vec<i64> = if rank == 0 { vec![-1, 1 << 33] } else { vec![0, 0] };
        let t = backend.tensor_from_slice(&values, &[2], 0).unwrap();
        pg.broadcast(std::slice::from_ref(&t), BroadcastOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(backend.tensor_to_vec::<i64>(&t).unwrap(), vec![-1, 1 << 33]);
    });
}
