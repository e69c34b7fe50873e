// Cone-search candidate queries backing the overlap selector.

mod common;

use common::*;
use nocturn_registry::repos::CalImageRepo;

const FIELD: i64 = 7001;
const FID: i16 = 4;

#[tokio::test]
async fn test_cone_search_keeps_near_drops_far() {
    let (_dir, store) = sqlite_store().await;

    let near = visible_cal_image(&store, 1, FIELD, FID, 150.05, 20.0, 61000.0).await;
    let _far = visible_cal_image(&store, 2, FIELD + 5, FID, 155.0, 20.0, 61000.0).await;

    let candidates = store
        .overlap_candidates(FID, 150.0, 20.0, 0.18, &[])
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].rid, near);
}

#[tokio::test]
async fn test_cone_search_orders_by_distance() {
    let (_dir, store) = sqlite_store().await;

    let farther = visible_cal_image(&store, 1, FIELD, FID, 150.12, 20.0, 61000.0).await;
    let nearer = visible_cal_image(&store, 2, FIELD, FID, 150.03, 20.0, 61001.0).await;
    let exact = visible_cal_image(&store, 3, FIELD, FID, 150.0, 20.0, 61002.0).await;

    let candidates = store
        .overlap_candidates(FID, 150.0, 20.0, 0.18, &[])
        .await
        .unwrap();
    let rids: Vec<i64> = candidates.iter().map(|c| c.rid).collect();
    assert_eq!(rids, vec![exact, nearer, farther]);
}

#[tokio::test]
async fn test_cone_search_respects_filter_and_visibility() {
    let (_dir, store) = sqlite_store().await;

    let _wrong_filter = visible_cal_image(&store, 1, FIELD, FID + 1, 150.0, 20.0, 61000.0).await;

    // A provisional image at the right place: registered with meta but
    // never finalized or promoted, so invisible.
    let expid = {
        use nocturn_registry::repos::ExposureRepo;
        store
            .add_exposure(&sample_exposure(FIELD, FID, 61000.0))
            .await
            .unwrap()
    };
    let mut new = sample_cal_image(expid, 2, FIELD, FID, 61000.0);
    new.status = 0;
    let (rid, _version) = store.register_cal_image(&new).await.unwrap();
    store
        .upsert_cal_image_meta(&meta_for(rid, FIELD, FID, 150.0, 20.0))
        .await
        .unwrap();

    let candidates = store
        .overlap_candidates(FID, 150.0, 20.0, 0.18, &[])
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn test_fine_tag_prune_is_an_index_hit() {
    let (_dir, store) = sqlite_store().await;

    let rid = visible_cal_image(&store, 1, FIELD, FID, 150.0, 20.0, 61000.0).await;
    let meta = store.get_cal_image_meta(rid).await.unwrap().unwrap();

    // Prune list containing the candidate's tag keeps it.
    let candidates = store
        .overlap_candidates(FID, 150.0, 20.0, 0.18, &[meta.hp9])
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);

    // Prune list without it drops the row before any exact test.
    let candidates = store
        .overlap_candidates(FID, 150.0, 20.0, 0.18, &[meta.hp9 + 1])
        .await
        .unwrap();
    assert!(candidates.is_empty());
}
