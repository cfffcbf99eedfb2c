//! End-to-end scenarios over the public index API.

mod utils;

use std::time::{Duration, Instant};

use thicket::{DistanceKind, Error, Index, IndexParams};

use utils::{assert_result_shape, brute_force_knn, l2_params, random_data};

const N: usize = 1000;
const DIM: usize = 64;

#[test]
fn build_and_query_returns_the_vector_itself() -> Result<(), Error> {
    let data = random_data(N, DIM, 42);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;

    let query = &data[..DIM];
    let hits = index.search(query, 1)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, 0);
    float_cmp::assert_approx_eq!(f32, hits[0].1, 0.0);
    Ok(())
}

#[test]
fn deleting_the_best_hit_hides_it() -> Result<(), Error> {
    let data = random_data(N, DIM, 43);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;

    let query = &data[..DIM];
    let best = index.search(query, 1)?[0].0;
    assert_eq!(best, 0);
    index.delete(best)?;

    let hits = index.search(query, 10)?;
    assert_result_shape(&hits, 10);
    assert!(!hits.is_empty());
    assert_ne!(hits[0].0, best);
    assert!(hits.iter().all(|&(id, _)| id != best));

    // Deleting twice reports the vector as gone.
    assert_eq!(index.delete(best), Err(Error::VectorNotFound));
    Ok(())
}

#[test]
fn refine_compacts_and_remaps_ids() -> Result<(), Error> {
    // Plant a near-duplicate of row 0 in the last slot; the swap-compact
    // remap will move it to id 0 once row 0 is deleted.
    let mut data = random_data(N, DIM, 44);
    let twin: Vec<f32> = data[..DIM].iter().map(|x| x + 1e-3).collect();
    data[(N - 1) * DIM..].copy_from_slice(&twin);

    let index = Index::new(l2_params());
    index.build(&data, DIM)?;

    let query: Vec<f32> = data[..DIM].to_vec();
    let top2 = index.search(&query, 2)?;
    assert_eq!(top2[0].0, 0);
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let last = (N - 1) as i32;
    assert_eq!(top2[1].0, last);

    index.delete(0)?;
    let refined = index.refine()?;
    assert_eq!(refined.count(), N - 1);
    assert_eq!(refined.deleted_count(), 0);

    // The old last row now answers to id 0, exactly.
    let hits = refined.search(&twin, 1)?;
    assert_eq!(hits[0].0, 0);
    float_cmp::assert_approx_eq!(f32, hits[0].1, 0.0);

    // Ids are contiguous in the compacted range.
    let wide = refined.search(&query, 20)?;
    assert_result_shape(&wide, 20);
    assert!(wide.iter().all(|&(id, _)| id >= 0 && (id as usize) < N - 1));
    Ok(())
}

#[test]
fn adding_past_the_threshold_rebuilds_in_the_background() -> Result<(), Error> {
    let mut params = l2_params();
    params.add_count_for_rebuild = 100;
    let data = random_data(N, DIM, 45);
    let index = Index::new(params);
    index.build(&data, DIM)?;
    assert_eq!(index.forest_size(), N);

    let extra = random_data(150, DIM, 46);
    index.add(&extra, DIM)?;
    assert_eq!(index.count(), N + 150);

    // The rebuild runs on a worker thread; wait for the swap to land.
    let deadline = Instant::now() + Duration::from_secs(30);
    while index.forest_size() != N + 150 {
        assert!(Instant::now() < deadline, "rebuild never landed");
        std::thread::sleep(Duration::from_millis(25));
    }

    // Queries still behave after the swap: added vectors are findable and
    // result shape invariants hold.
    let query = &extra[..DIM];
    let hits = index.search(query, 10)?;
    assert_result_shape(&hits, 10);
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let first_added = N as i32;
    assert_eq!(hits[0].0, first_added);
    float_cmp::assert_approx_eq!(f32, hits[0].1, 0.0);
    Ok(())
}

#[test]
fn cosine_normalizes_stored_rows() -> Result<(), Error> {
    let mut params = l2_params();
    params.dist_calc_method = DistanceKind::Cosine;
    let index = Index::new(params);

    let data = random_data(64, 16, 47);
    index.build(&data, 16)?;

    // Add a row of magnitude 17; the stored copy must come out at the base.
    let loud: Vec<f32> = (0..16)
        .map(|i| if i == 0 { 17.0_f32 } else { 0.0 })
        .collect();
    index.add(&loud, 16)?;

    let stored = index
        .vector(64)
        .map_or_else(|| unreachable!("row 64 exists"), |row| row);
    let norm = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
    float_cmp::assert_approx_eq!(f32, norm, 1.0, epsilon = 1e-4);
    Ok(())
}

#[test]
fn cosine_normalizes_integer_rows_to_the_type_base() -> Result<(), Error> {
    let mut params = l2_params();
    params.dist_calc_method = DistanceKind::Cosine;
    params.bkt_leaf_size = 2;
    let index = Index::new(params);

    let data: Vec<i8> = vec![
        17, 0, 0, 0, //
        0, 5, 0, 0, //
        0, 0, 9, 0, //
        3, 3, 0, 0, //
    ];
    index.build(&data, 4)?;
    let stored = index
        .vector(0)
        .map_or_else(|| unreachable!("row 0 exists"), |row| row);
    let norm = stored
        .iter()
        .map(|&x| f32::from(x) * f32::from(x))
        .sum::<f32>()
        .sqrt();
    assert!((norm - 127.0).abs() <= 1.0, "norm was {norm}");
    Ok(())
}

#[test]
fn dimension_mismatch_leaves_the_index_unchanged() -> Result<(), Error> {
    let data = random_data(200, DIM, 48);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;

    let wrong = random_data(4, 32, 49);
    assert_eq!(index.add(&wrong, 32), Err(Error::DimensionSizeMismatch));
    assert_eq!(index.count(), 200);
    Ok(())
}

#[test]
fn empty_inputs_are_rejected() {
    let index = Index::new(l2_params());
    assert_eq!(index.build(&[], DIM), Err(Error::EmptyData));
    assert_eq!(index.build(&[1.0], 0), Err(Error::EmptyData));
    assert_eq!(index.search(&[0.0; DIM], 5), Err(Error::EmptyIndex));
}

#[test]
fn save_and_load_answer_identically() -> Result<(), Error> {
    let data = random_data(N, DIM, 50);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;
    index.delete(17)?;
    index.delete(400)?;

    let dir = tempdir::TempDir::new("thicket-snapshot").map_err(|_| Error::FailedCreateFile)?;
    index.save_to_dir(dir.path())?;
    let loaded = Index::<f32>::load_from_dir(dir.path(), l2_params())?;

    assert_eq!(loaded.count(), N);
    assert_eq!(loaded.deleted_count(), 2);
    for probe in [0_usize, 99, 500] {
        let query = &data[probe * DIM..(probe + 1) * DIM];
        assert_eq!(index.search(query, 10)?, loaded.search(query, 10)?);
    }
    Ok(())
}

#[test]
fn blob_save_and_load_round_trip() -> Result<(), Error> {
    let data = random_data(300, 16, 51);
    let index = Index::new(l2_params());
    index.build(&data, 16)?;

    let mut blobs: Vec<Vec<u8>> = vec![Vec::new(); 4];
    {
        let [v, t, g, d] = &mut blobs[..] else {
            unreachable!("four blobs");
        };
        let mut writers: [&mut dyn std::io::Write; 4] = [v, t, g, d];
        index.save_to_writers(&mut writers)?;
    }

    // Short inputs are rejected on both ends.
    let (mut a, mut b) = (Vec::new(), Vec::new());
    let mut short: [&mut dyn std::io::Write; 2] = [&mut a, &mut b];
    assert_eq!(index.save_to_writers(&mut short), Err(Error::LackOfInputs));
    assert_eq!(
        Index::<f32>::load_from_blobs(&[&blobs[0][..]], l2_params()).err(),
        Some(Error::LackOfInputs)
    );

    // Without the deletions blob, everything loads live.
    let loaded = Index::<f32>::load_from_blobs(
        &[&blobs[0][..], &blobs[1][..], &blobs[2][..]],
        l2_params(),
    )?;
    assert_eq!(loaded.count(), 300);
    assert_eq!(loaded.deleted_count(), 0);

    let query = &data[..16];
    assert_eq!(index.search(query, 5)?, loaded.search(query, 5)?);
    Ok(())
}

#[test]
fn refine_preserves_hidden_deletion_answers() -> Result<(), Error> {
    let data = random_data(N, DIM, 52);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;
    for id in (0..100).step_by(10) {
        index.delete(id)?;
    }

    let query = &data[500 * DIM..501 * DIM];
    let before = index.search(query, 5)?;
    let refined = index.refine()?;
    let after = refined.search(query, 5)?;

    assert_eq!(refined.count(), N - 10);
    assert_result_shape(&after, 5);
    // The nearest live vector is the query itself; approximation tolerance
    // cannot move a distance-zero answer.
    float_cmp::assert_approx_eq!(f32, before[0].1, 0.0);
    float_cmp::assert_approx_eq!(f32, after[0].1, 0.0);
    Ok(())
}

#[test]
fn duplicate_vectors_come_back_distinct() -> Result<(), Error> {
    let mut params = l2_params();
    params.bkt_leaf_size = 4;
    let dim = 8;
    let mut data = random_data(100, dim, 53);
    let dup: Vec<f32> = data[..dim].to_vec();
    for _ in 0..40 {
        data.extend_from_slice(&dup);
    }
    let index = Index::new(params);
    index.build(&data, dim)?;

    let hits = index.search(&dup, 10)?;
    assert_result_shape(&hits, 10);
    assert!(!hits.is_empty());
    float_cmp::assert_approx_eq!(f32, hits[0].1, 0.0);
    Ok(())
}

#[test]
fn exact_match_deletion_by_content() -> Result<(), Error> {
    let data = random_data(400, 16, 54);
    let index = Index::new(l2_params());
    index.build(&data, 16)?;

    index.delete_matching(&data[..16], 16)?;
    assert!(index.deleted_count() >= 1);
    let hits = index.search(&data[..16], 5)?;
    assert!(hits.iter().all(|&(id, _)| id != 0));
    Ok(())
}

#[test]
fn tight_budgets_still_terminate() -> Result<(), Error> {
    let mut params = l2_params();
    params.max_check = 8;
    params.continuous_limit = 1;
    params.initial_dynamic_pivots = 2;
    let data = random_data(N, DIM, 55);
    let index = Index::new(params);
    index.build(&data, DIM)?;

    let hits = index.search(&data[..DIM], 10)?;
    assert_result_shape(&hits, 10);
    Ok(())
}

#[test]
fn searches_recall_their_exact_neighbors() -> Result<(), Error> {
    let data = random_data(N, DIM, 56);
    let index = Index::new(l2_params());
    index.build(&data, DIM)?;

    // Approximate search over a well-built graph should agree with brute
    // force on most of the top 10.
    let mut agree = 0_usize;
    for probe in 0..20_usize {
        let query = &data[probe * DIM..(probe + 1) * DIM];
        let exact = brute_force_knn(&data, DIM, query, 10, DistanceKind::L2);
        let approx = index.search(query, 10)?;
        agree += approx
            .iter()
            .filter(|(id, _)| exact.iter().any(|(e, _)| e == id))
            .count();
    }
    assert!(agree >= 150, "recall too low: {agree}/200");
    Ok(())
}

#[test]
fn concurrent_searches_survive_concurrent_deletes() -> Result<(), Error> {
    let mut params = l2_params();
    params.number_of_threads = 4;
    let data = random_data(N, DIM, 57);
    let index = std::sync::Arc::new(Index::new(params));
    index.build(&data, DIM)?;

    let mut handles = Vec::new();
    for worker in 0..4_usize {
        let index = std::sync::Arc::clone(&index);
        let data = data.clone();
        handles.push(std::thread::spawn(move || -> Result<(), Error> {
            for round in 0..50_usize {
                let probe = (worker * 50 + round) % N;
                let query = &data[probe * DIM..(probe + 1) * DIM];
                let hits = index.search(query, 5)?;
                assert_result_shape(&hits, 5);
                if worker == 0 {
                    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    let victim = (round * 7 % N) as i32;
                    // Double deletes are expected across rounds.
                    let _ = index.delete(victim);
                }
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().map_err(|_| Error::Fail)??;
    }

    // Everything deleted during the storm stays hidden afterwards.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let victims: Vec<i32> = (0..50_usize).map(|round| (round * 7 % N) as i32).collect();
    let hits = index.search(&data[..DIM], 10)?;
    assert_result_shape(&hits, 10);
    assert!(hits.iter().all(|(id, _)| !victims.contains(id)));
    Ok(())
}
