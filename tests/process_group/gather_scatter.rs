use muster::{AllgatherOptions, ReduceOp, ReduceScatterOptions, Tensor};

use super::helpers::run_ranks;

#[test]
fn test_allgather_into_preformatted_lists() {
    run_ranks(2, 1, |rank, pg, backend| {
        let input = backend
            .tensor_from_slice(&[rank as i32; 3], &[3], 0)
            .unwrap();
        let outputs = vec![vec![
            backend.tensor_from_slice(&[0i32; 3], &[3], 0).unwrap(),
            backend.tensor_from_slice(&[0i32; 3], &[3], 0).unwrap(),
        ]];
        pg.allgather(
            &outputs,
            std::slice::from_ref(&input),
            AllgatherOptions::default(),
        )
        .unwrap()
        .wait()
        .unwrap();
        assert_eq!(
            backend.tensor_to_vec::<i32>(&outputs[0][0]).unwrap(),
            vec![0, 0, 0],
            "rank {rank} slice 0"
        );
        assert_eq!(
            backend.tensor_to_vec::<i32>(&outputs[0][1]).unwrap(),
            vec![1, 1, 1],
            "rank {rank} slice 1"
        );
    });
}

#[test]
fn test_allgather_then_local_slice_recovers_input() {
    run_ranks(3, 1, |rank, pg, backend| {
        let values: Vec<f32> = (0..5).map(|i| (rank * 100 + i) as f32).collect();
        let input = backend.tensor_from_slice(&values, &[5], 0).unwrap();
        let outputs = vec![(0..3)
            .map(|_| backend.tensor_from_slice(&[0.0f32; 5], &[5], 0).unwrap())
            .collect::<Vec<_>>()];
        pg.allgather(
            &outputs,
            std::slice::from_ref(&input),
            AllgatherOptions::default(),
        )
        .unwrap()
        .wait()
        .unwrap();
        // This rank's own slice round-trips exactly.
        assert_eq!(
            backend.tensor_to_vec::<f32>(&outputs[0][rank]).unwrap(),
            values
        );
        for peer in 0..3 {
            let expected: Vec<f32> = (0..5).map(|i| (peer * 100 + i) as f32).collect();
            assert_eq!(
                backend.tensor_to_vec::<f32>(&outputs[0][peer]).unwrap(),
                expected
            );
        }
    });
}

#[test]
fn test_allgather_no_copy_writes_the_flat_buffer_in_place() {
    use muster::Backend as _;

    run_ranks(2, 1, |rank, pg, backend| {
        // Outputs are consecutive views of one flat buffer, and the input
        // is this rank's own slice: the no-copy predicates hold.
        let flat = backend.tensor_from_slice(&[0i64; 8], &[8], 0).unwrap();
        let slices: Vec<Tensor<_>> = (0..2).map(|j| flat.narrow(j * 4, 4).unwrap()).collect();
        let input = slices[rank].clone();

        // Seed this rank's slice on the compute stream.
        let seeded = backend
            .tensor_from_slice(&vec![(rank as i64 + 1) * 11; 4], &[4], 0)
            .unwrap();
        let stream = backend.current_stream(0);
        backend.copy_on_stream(&input, &seeded, &stream).unwrap();

        let outputs = vec![slices];
        pg.allgather(
            &outputs,
            std::slice::from_ref(&input),
            AllgatherOptions { no_copy: true },
        )
        .unwrap()
        .wait()
        .unwrap();
        assert_eq!(
            backend.tensor_to_vec::<i64>(&flat).unwrap(),
            vec![11, 11, 11, 11, 22, 22, 22, 22],
            "rank {rank} flat buffer"
        );
    });
}

#[test]
fn test_reduce_scatter_sum() {
    run_ranks(2, 1, |rank, pg, backend| {
        // Rank 0 contributes [[1,2],[3,4]], rank 1 [[5,6],[7,8]].
        let base = if rank == 0 { [[1i32, 2], [3, 4]] } else { [[5, 6], [7, 8]] };
        let inputs = vec![vec![
            backend.tensor_from_slice(&base[0], &[2], 0).unwrap(),
            backend.tensor_from_slice(&base[1], &[2], 0).unwrap(),
        ]];
        let output = backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap();
        let opts = ReduceScatterOptions {
            reduce_op: ReduceOp::Sum,
            no_copy: false,
        };
        pg.reduce_scatter(std::slice::from_ref(&output), &inputs, opts)
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 0 { vec![6, 8] } else { vec![10, 12] };
        assert_eq!(backend.tensor_to_vec::<i32>(&output).unwrap(), expected);
    });
}

#[test]
fn test_reduce_scatter_no_copy_from_preformatted_buffer() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<f32> = (0..6).map(|i| (rank * 10 + i) as f32).collect();
        let flat = backend.tensor_from_slice(&values, &[6], 0).unwrap();
        let slices: Vec<Tensor<_>> = (0..2).map(|j| flat.narrow(j * 3, 3).unwrap()).collect();
        // The output is this rank's slice of the same buffer, which the
        // no-copy predicate explicitly permits.
        let output = slices[rank].clone();
        let inputs = vec![slices];
        let opts = ReduceScatterOptions {
            reduce_op: ReduceOp::Sum,
            no_copy: true,
        };
        pg.reduce_scatter(std::slice::from_ref(&output), &inputs, opts)
            .unwrap()
            .wait()
            .unwrap();
        // Chunk r of elementwise sum of [0..6] and [10..16].
        let expected: Vec<f32> = (0..3)
            .map(|i| (rank * 3 + i) as f32 + (10 + rank * 3 + i) as f32)
            .collect();
        assert_eq!(backend.tensor_to_vec::<f32>(&output).unwrap(), expected);
    });
}

#[test]
fn test_allgather_rejects_short_output_list() {
    run_ranks(1, 1, |_rank, pg, backend| {
        let input = backend.tensor_from_slice(&[1.0f32], &[1], 0).unwrap();
        // World size 1 wants exactly one output per list; two is invalid.
        let outputs = vec![vec![
            backend.tensor_from_slice(&[0.0f32], &[1], 0).unwrap(),
            backend.tensor_from_slice(&[0.0f32], &[1], 0).unwrap(),
        ]];
        let err = pg
            .allgather(
                &outputs,
                std::slice::from_ref(&input),
                AllgatherOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, muster::MusterError::InvalidArgument(_)));
    });
}
