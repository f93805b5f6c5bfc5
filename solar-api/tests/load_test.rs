use bytes::Bytes;
use solar_api::service::{NewImage, SolarInput};
use solar_api::{BackendDocumentStore, ServiceError, ServiceSettings, SolarService};
use solar_store_backends::{local::LocalBackend, Backend};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

async fn setup_test_service() -> (Arc<SolarService>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(
        temp_dir.path().to_path_buf(),
        "test-physical-bucket".to_string(),
        "http://localhost/media".to_string(),
    ));

    backend.init().await.unwrap();

    let documents = Arc::new(BackendDocumentStore::new(backend.clone()));
    let service = Arc::new(SolarService::new(
        backend,
        documents,
        ServiceSettings {
            collection: "solar".to_string(),
            empty_list_not_found: false,
        },
    ));

    (service, temp_dir)
}

fn panel(name: String) -> SolarInput {
    SolarInput {
        name: Some(name),
        description: None,
        image: Some(NewImage {
            file_name: Some("panel.png".to_string()),
            content_type: Some("image/png".to_string()),
            data: Bytes::from_static(b"png bytes"),
        }),
    }
}

#[tokio::test]
async fn test_concurrent_same_name_creates_store_one() {
    let (service, _temp_dir) = setup_test_service().await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.create(panel("Panel A".to_string())).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;

    let mut created = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => created += 1,
            Err(ServiceError::DuplicateName(_)) | Err(ServiceError::DuplicateKey { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(service.list().await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Run with: cargo test --test load_test -- --ignored
async fn test_concurrent_creates() {
    let (service, _temp_dir) = setup_test_service().await;

    let start = Instant::now();
    let num_operations = 100;

    let handles: Vec<_> = (0..num_operations)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move { service.create(panel(format!("Panel {}", i))).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;

    let duration = start.elapsed();
    let success_count = results
        .iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();

    println!(
        "Concurrent creates: {} operations in {:?} ({:.2} ops/sec)",
        success_count,
        duration,
        success_count as f64 / duration.as_secs_f64()
    );

    assert_eq!(success_count, num_operations);
    assert_eq!(service.list().await.unwrap().len(), num_operations);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_reads() {
    let (service, _temp_dir) = setup_test_service().await;

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(service.create(panel(format!("Panel {}", i))).await.unwrap());
    }

    let start = Instant::now();
    let num_reads = 500;

    let handles: Vec<_> = (0..num_reads)
        .map(|i| {
            let service = service.clone();
            let id = ids[i % ids.len()].clone();
            tokio::spawn(async move { service.get(&id).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;

    let duration = start.elapsed();
    let success_count = results
        .iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();

    println!(
        "Concurrent reads: {} operations in {:?} ({:.2} ops/sec)",
        success_count,
        duration,
        success_count as f64 / duration.as_secs_f64()
    );

    assert_eq!(success_count, num_reads);
}
