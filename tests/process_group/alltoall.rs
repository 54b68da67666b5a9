use super::helpers::run_ranks;

#[test]
fn test_alltoall_base_even_split() {
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<f32> = vec![(rank * 10) as f32, (rank * 10 + 1) as f32];
        let input = backend.tensor_from_slice(&values, &[2], 0).unwrap();
        let output = backend.tensor_from_slice(&[0.0f32; 2], &[2], 0).unwrap();
        pg.alltoall_base(&output, &input, &[], &[]).unwrap().wait().unwrap();
        // Peer p receives element p of every rank.
        let expected: Vec<f32> = vec![rank as f32, (10 + rank) as f32];
        assert_eq!(backend.tensor_to_vec::<f32>(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_base_with_split_sizes() {
    run_ranks(2, 1, |rank, pg, backend| {
        // Rank 0 sends [1,2,3 | 4] with splits [3,1];
        // rank 1 sends [5 | 6,7,8] with splits [1,3].
        let (values, in_splits, out_splits): (Vec<i32>, Vec<usize>, Vec<usize>) = if rank == 0 {
            (vec![1, 2, 3, 4], vec![3, 1], vec![3, 1])
        } else {
            (vec![5, 6, 7, 8], vec![1, 3], vec![1, 3])
        };
        let input = backend.tensor_from_slice(&values, &[4], 0).unwrap();
        let output = backend.tensor_from_slice(&[0i32; 4], &[4], 0).unwrap();
        pg.alltoall_base(&output, &input, &out_splits, &in_splits)
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 0 {
            // Own first slice, then rank 1's slice for rank 0.
            vec![1, 2, 3, 5]
        } else {
            // Rank 0's slice for rank 1, then own trailing slice.
            vec![4, 6, 7, 8]
        };
        assert_eq!(backend.tensor_to_vec::<i32>(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_base_with_rows() {
    // Split sizes count rows of dimension 0; each row holds 2 elements.
    run_ranks(2, 1, |rank, pg, backend| {
        let values: Vec<i32> = (0..8).map(|i| rank as i32 * 100 + i).collect();
        let input = backend.tensor_from_slice(&values, &[4, 2], 0).unwrap();
        let output = backend.tensor_from_slice(&[0i32; 8], &[4, 2], 0).unwrap();
        let splits = [2usize, 2];
        pg.alltoall_base(&output, &input, &splits, &splits)
            .unwrap()
            .wait()
            .unwrap();
        let expected: Vec<i32> = if rank == 0 {
            vec![0, 1, 2, 3, 100, 101, 102, 103]
        } else {
            vec![4, 5, 6, 7, 104, 105, 106, 107]
        };
        assert_eq!(backend.tensor_to_vec::<i32>(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_tensor_lists() {
    run_ranks(2, 1, |rank, pg, backend| {
        // inputs[p] is the tensor destined for peer p.
        let base = rank as i32 * 4;
        let inputs = vec![
            backend.tensor_from_slice(&[base + 1, base + 2], &[2], 0).unwrap(),
            backend.tensor_from_slice(&[base + 3, base + 4], &[2], 0).unwrap(),
        ];
        let outputs = vec![
            backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap(),
            backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap(),
        ];
        pg.alltoall(&outputs, &inputs).unwrap().wait().unwrap();
        // outputs[p] holds what peer p aimed at this rank.
        let expected_from = |peer: usize| {
            let peer_base = peer as i32 * 4;
            vec![peer_base + rank as i32 * 2 + 1, peer_base + rank as i32 * 2 + 2]
        };
        assert_eq!(
            backend.tensor_to_vec::<i32>(&outputs[0]).unwrap(),
            expected_from(0)
        );
        assert_eq!(
            backend.tensor_to_vec::<i32>(&outputs[1]).unwrap(),
            expected_from(1)
        );
    });
}

#[test]
fn test_alltoall_allows_unequal_sizes_per_peer() {
    run_ranks(2, 1, |rank, pg, backend| {
        // Rank r sends r+1 elements to peer 0 and 2 to peer 1.
        let inputs = vec![
            backend
                .tensor_from_slice(&vec![rank as i32; rank + 1], &[rank + 1], 0)
                .unwrap(),
            backend.tensor_from_slice(&[7i32, 8], &[2], 0).unwrap(),
        ];
        let outputs = if rank == 0 {
            vec![
                backend.tensor_from_slice(&[0i32; 1], &[1], 0).unwrap(),
                backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap(),
            ]
        } else {
            vec![
                backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap(),
                backend.tensor_from_slice(&[0i32; 2], &[2], 0).unwrap(),
            ]
        };
        pg.alltoall(&outputs, &inputs).unwrap().wait().unwrap();
        if rank == 0 {
            assert_eq!(backend.tensor_to_vec::<i32>(&outputs[0]).unwrap(), vec![0]);
            assert_eq!(backend.tensor_to_vec::<i32>(&outputs[1]).unwrap(), vec![1, 1]);
        } else {
            assert_eq!(backend.tensor_to_vec::<i32>(&outputs[0]).unwrap(), vec![7, 8]);
            assert_eq!(backend.tensor_to_vec::<i32>(&outputs[1]).unwrap(), vec![7, 8]);
        }
    });
}

#[test]
fn test_alltoall_base_rejects_bad_splits() {
    run_ranks(1, 1, |_rank, pg, backend| {
        let input = backend.tensor_from_slice(&[1i32, 2, 3], &[3], 0).unwrap();
        let output = backend.tensor_from_slice(&[0i32; 3], &[3], 0).unwrap();
        // Splits sum to 2, dimension 0 holds 3.
        let err = pg
            .alltoall_base(&output, &input, &[2], &[2])
            .unwrap_err();
        assert!(matches!(err, muster::MusterError::InvalidArgument(_)));
    });
}
