use std::sync::Arc;

use mangashelf_core::error::AppError;
use mangashelf_core::models::{MetadataStatus, NewSeries};
use mangashelf_core::resolver::{ResolutionAction, ResolutionService, ResolverConfig};
use mangashelf_core::traits::{NoLookup, ResolutionStore, SeriesInsert};
use mangashelf_db::LibraryRepository;

use crate::common::{insert_entry, setup_test_db};

fn resolver(repo: LibraryRepository) -> ResolutionService<LibraryRepository, NoLookup> {
    ResolutionService::new(repo, NoLookup, ResolverConfig::default())
}

async fn live_series_count(pool: &sqlx::PgPool, normalized_title: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM series WHERE normalized_title = $1 AND deleted_at IS NULL",
    )
    .bind(normalized_title)
    .fetch_one(pool)
    .await
    .unwrap();
    count
}

#[tokio::test]
async fn links_entry_to_existing_series() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);

    let SeriesInsert::Created(series) = repo
        .insert_series(&NewSeries::from_title("Test Enrichment Series"))
        .await
        .unwrap()
    else {
        panic!("series should be created");
    };
    let entry_id = insert_entry(
        &repo,
        "Test Enrichment Series",
        "mangadex",
        "https://mangadex.org/title/test-enrichment",
    )
    .await;

    let resolution = resolver(repo.clone()).resolve(entry_id).await.unwrap();

    assert_eq!(resolution.series_id, series.id);
    assert_eq!(resolution.action, ResolutionAction::LinkedExisting);
    let entry = repo.get_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.series_id, Some(series.id));
    assert_eq!(entry.metadata_status, MetadataStatus::Enriched);
}

#[tokio::test]
async fn duplicate_insert_reports_conflict() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);

    let first = repo.insert_series(&NewSeries::from_title("One Piece")).await.unwrap();
    let second = repo.insert_series(&NewSeries::from_title("ONE PIECE!")).await.unwrap();

    assert!(matches!(first, SeriesInsert::Created(_)));
    assert!(matches!(second, SeriesInsert::Conflict));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolutions_create_one_series() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool.clone());

    let mut entries = Vec::new();
    for i in 0..8 {
        let source = if i % 2 == 0 { "mangadex" } else { "other" };
        entries.push(
            insert_entry(&repo, "Duplicate Test Series", source, &format!("https://example.com/dup-{i}")).await,
        );
    }

    let service = Arc::new(resolver(repo.clone()));
    let handles: Vec<_> = entries
        .iter()
        .map(|&id| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.resolve(id).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let resolutions: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
    let series_id = resolutions[0].series_id;
    assert!(resolutions.iter().all(|r| r.series_id == series_id));
    assert_eq!(live_series_count(&pool, "duplicate test series").await, 1);
    for id in entries {
        let entry = repo.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.series_id, Some(series_id));
        assert_eq!(entry.metadata_status, MetadataStatus::Enriched);
    }
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool.clone());
    let entry_id = insert_entry(&repo, "Idempotent Series", "other", "https://example.com/i").await;
    let service = resolver(repo);

    let first = service.resolve(entry_id).await.unwrap();
    let second = service.resolve(entry_id).await.unwrap();

    assert_eq!(first.action, ResolutionAction::CreatedSeries);
    assert_eq!(second.action, ResolutionAction::AlreadyLinked);
    assert_eq!(first.series_id, second.series_id);
    assert_eq!(live_series_count(&pool, "idempotent series").await, 1);
}

#[tokio::test]
async fn soft_deleted_entry_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);
    let entry_id = insert_entry(&repo, "Removed", "other", "https://example.com/r").await;
    assert!(repo.soft_delete_entry(entry_id).await.unwrap());

    let err = resolver(repo).resolve(entry_id).await.unwrap_err();

    assert!(matches!(err, AppError::EntryNotFound(id) if id == entry_id));
}

#[tokio::test]
async fn soft_deleted_series_frees_its_title() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool.clone());
    let SeriesInsert::Created(old) = repo.insert_series(&NewSeries::from_title("Reboot")).await.unwrap() else {
        panic!("series should be created");
    };
    assert!(repo.soft_delete_series(old.id).await.unwrap());
    let entry_id = insert_entry(&repo, "Reboot", "other", "https://example.com/reboot").await;

    let resolution = resolver(repo.clone()).resolve(entry_id).await.unwrap();

    assert_ne!(resolution.series_id, old.id);
    assert_eq!(resolution.action, ResolutionAction::CreatedSeries);
    assert!(repo.get_series(old.id).await.unwrap().is_none());
}

#[tokio::test]
async fn link_to_deleted_series_is_refused() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);
    let SeriesInsert::Created(series) = repo.insert_series(&NewSeries::from_title("Gone Series")).await.unwrap() else {
        panic!("series should be created");
    };
    repo.soft_delete_series(series.id).await.unwrap();
    let entry_id = insert_entry(&repo, "Gone Series", "other", "https://example.com/g").await;

    assert!(!repo.link_entry(entry_id, series.id).await.unwrap());

    let entry = repo.get_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.metadata_status, MetadataStatus::Pending);
    assert!(entry.series_id.is_none());
}

#[tokio::test]
async fn mark_failed_records_error_but_never_downgrades() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);
    let failing = insert_entry(&repo, "Failing", "other", "https://example.com/f").await;
    let enriched = insert_entry(&repo, "Enriched", "other", "https://example.com/e").await;
    resolver(repo.clone()).resolve(enriched).await.unwrap();

    repo.mark_entry_failed(failing, "source unavailable").await.unwrap();
    repo.mark_entry_failed(enriched, "late failure").await.unwrap();

    let failing = repo.get_entry(failing).await.unwrap().unwrap();
    assert_eq!(failing.metadata_status, MetadataStatus::Failed);
    assert_eq!(failing.metadata_error.as_deref(), Some("source unavailable"));
    let enriched = repo.get_entry(enriched).await.unwrap().unwrap();
    assert_eq!(enriched.metadata_status, MetadataStatus::Enriched);
    assert!(enriched.metadata_error.is_none());
}

#[tokio::test]
async fn list_entry_ids_filters_by_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = LibraryRepository::new(pool);
    let pending = insert_entry(&repo, "Pending One", "other", "https://example.com/p").await;
    let done = insert_entry(&repo, "Done One", "other", "https://example.com/d").await;
    resolver(repo.clone()).resolve(done).await.unwrap();

    let ids = repo.list_entry_ids(MetadataStatus::Pending, 10).await.unwrap();

    assert_eq!(ids, vec![pending]);
}
