//! Integration tests for [`WebDavStorage`] against a loopback WebDAV fake.
//!
//! The fake keeps collections and objects in memory and answers the
//! way a real share does: `MKCOL` on an existing collection is `405`,
//! `DELETE` of a missing object is `404`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;

use crowdsky_cloud::{BulkStorage, StorageError, WebDavStorage};

#[derive(Default)]
struct FakeDav {
    collections: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<(String, String)>>,
    /// Answer every `MKCOL` with this status instead of 201/405.
    mkcol_status: Mutex<Option<StatusCode>>,
}

async fn handle(
    State(dav): State<Arc<FakeDav>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    let path = uri.path().to_string();
    dav.requests
        .lock()
        .unwrap()
        .push((method.to_string(), path.clone()));

    if !headers.contains_key("authorization") {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    }

    match method.as_str() {
        "MKCOL" => {
            if let Some(status) = *dav.mkcol_status.lock().unwrap() {
                return (status, Vec::new());
            }
            if dav.collections.lock().unwrap().insert(path) {
                (StatusCode::CREATED, Vec::new())
            } else {
                (StatusCode::METHOD_NOT_ALLOWED, Vec::new())
            }
        }
        "PUT" => {
            dav.objects.lock().unwrap().insert(path, body.to_vec());
            (StatusCode::CREATED, Vec::new())
        }
        "GET" => match dav.objects.lock().unwrap().get(&path) {
            Some(data) => (StatusCode::OK, data.clone()),
            None => (StatusCode::NOT_FOUND, b"missing".to_vec()),
        },
        "DELETE" => match dav.objects.lock().unwrap().remove(&path) {
            Some(_) => (StatusCode::NO_CONTENT, Vec::new()),
            None => (StatusCode::NOT_FOUND, Vec::new()),
        },
        _ => (StatusCode::BAD_REQUEST, Vec::new()),
    }
}

/// Start the fake on an ephemeral port and return a client for it.
async fn start_fake() -> (Arc<FakeDav>, WebDavStorage) {
    let dav = Arc::new(FakeDav::default());
    let app = Router::new()
        .fallback(handle)
        .with_state(Arc::clone(&dav));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let storage = WebDavStorage::new(format!("http://{addr}/"), "share-token");
    (dav, storage)
}

#[tokio::test]
async fn create_dir_is_idempotent() {
    let (dav, storage) = start_fake().await;

    storage.create_dir("/crowdsky/stacks/user_1").await.unwrap();
    storage.create_dir("/crowdsky/stacks/user_1").await.unwrap();

    let collections = dav.collections.lock().unwrap();
    assert!(collections.contains("/crowdsky"));
    assert!(collections.contains("/crowdsky/stacks"));
    assert!(collections.contains("/crowdsky/stacks/user_1"));

    let mkcols = dav
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|(m, _)| m == "MKCOL")
        .count();
    assert_eq!(mkcols, 6, "every level is created on each call");
}

#[tokio::test]
async fn put_then_get_streams_file_contents() {
    let (dav, storage) = start_fake().await;
    let dir = tempfile::tempdir().unwrap();

    let local = dir.path().join("stack.fits");
    tokio::fs::write(&local, b"SIMPLE  =                    T").await.unwrap();
    storage
        .put_object(&local, "/crowdsky/stacks/stack_c_1.fits")
        .await
        .unwrap();
    assert!(dav
        .objects
        .lock()
        .unwrap()
        .contains_key("/crowdsky/stacks/stack_c_1.fits"));

    let fetched = dir.path().join("nested/copy.fits");
    storage
        .get_object("/crowdsky/stacks/stack_c_1.fits", &fetched)
        .await
        .unwrap();
    let data = tokio::fs::read(&fetched).await.unwrap();
    assert_eq!(data, b"SIMPLE  =                    T");
}

#[tokio::test]
async fn get_missing_object_is_api_error() {
    let (_dav, storage) = start_fake().await;
    let dir = tempfile::tempdir().unwrap();

    let err = storage
        .get_object("/crowdsky/none.fits", &dir.path().join("none.fits"))
        .await
        .unwrap_err();
    match err {
        StorageError::Api { status, path, .. } => {
            assert_eq!(status, 404);
            assert_eq!(path, "/crowdsky/none.fits");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_treats_not_found_as_success() {
    let (dav, storage) = start_fake().await;
    dav.objects
        .lock()
        .unwrap()
        .insert("/crowdsky/old.fits".to_string(), vec![1, 2, 3]);

    storage.delete_object("/crowdsky/old.fits").await.unwrap();
    storage.delete_object("/crowdsky/old.fits").await.unwrap();

    assert!(dav.objects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn upload_of_missing_local_file_is_io_error() {
    let (_dav, storage) = start_fake().await;
    let err = storage
        .put_object(std::path::Path::new("/nonexistent/stack.fits"), "/x.fits")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
}

#[tokio::test]
async fn mkcol_accepts_any_success_status() {
    let (dav, storage) = start_fake().await;

    for status in [StatusCode::OK, StatusCode::NO_CONTENT] {
        *dav.mkcol_status.lock().unwrap() = Some(status);
        storage.create_dir("/crowdsky/stacks").await.unwrap();
    }

    *dav.mkcol_status.lock().unwrap() = Some(StatusCode::CONFLICT);
    let err = storage.create_dir("/crowdsky/stacks").await.unwrap_err();
    assert!(matches!(err, StorageError::Api { status: 409, .. }));
}

#[tokio::test]
async fn reserved_characters_stay_in_the_path() {
    let (dav, storage) = start_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("stack.fits");
    tokio::fs::write(&local, b"stack").await.unwrap();

    storage.create_dir("/crowdsky/M#31").await.unwrap();
    storage
        .put_object(&local, "/crowdsky/M#31/NGC 7000?.fits")
        .await
        .unwrap();

    assert!(dav.collections.lock().unwrap().contains("/crowdsky/M%2331"));
    assert!(dav
        .objects
        .lock()
        .unwrap()
        .contains_key("/crowdsky/M%2331/NGC%207000%3F.fits"));
}
