mod common;

use common::{assert_monotonic, collect, sample_bytes};
use resume_dl::{DownloadError, DownloadEvent, DownloadManager, DownloadOptions, DownloadRequest};
use tempfile::TempDir;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn manager(chunk_size: usize) -> DownloadManager {
    DownloadManager::new(DownloadOptions::default().with_chunk_size(chunk_size)).unwrap()
}

#[tokio::test]
async fn full_response_is_streamed_in_chunks() {
    let server = MockServer::start().await;
    let data = sample_bytes(10_000);
    Mock::given(method("GET"))
        .and(path("/runtime.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("runtime.zip");
    let manager = manager(4096);
    let stream = manager
        .start_download(DownloadRequest::new(
            "runtime",
            format!("{}/runtime.zip", server.uri()),
            &destination,
        ))
        .unwrap();
    let (events, err) = collect(stream).await;

    assert!(err.is_none(), "{err:?}");
    assert_monotonic(&events);
    assert_eq!(
        events,
        vec![
            DownloadEvent::Started {
                resumed_bytes: 0,
                total_bytes: 10_000
            },
            DownloadEvent::Progress {
                bytes_written: 4096,
                total_bytes: 10_000
            },
            DownloadEvent::Progress {
                bytes_written: 8192,
                total_bytes: 10_000
            },
            DownloadEvent::Progress {
                bytes_written: 10_000,
                total_bytes: 10_000
            },
            DownloadEvent::Completed {
                destination: destination.clone(),
                total_bytes: 10_000
            },
        ]
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn partial_file_resumes_with_range_request() {
    let server = MockServer::start().await;
    let data = sample_bytes(3_000);
    let resumed = 1_000;
    Mock::given(method("GET"))
        .and(path("/model.gguf"))
        .and(header("range", "bytes=1000-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 1000-2999/3000")
                .set_body_bytes(data[resumed..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("model.gguf");
    std::fs::write(dir.path().join("model.gguf.part"), &data[..resumed]).unwrap();

    let manager = manager(1024);
    let stream = manager
        .start_download(DownloadRequest::new(
            "model",
            format!("{}/model.gguf", server.uri()),
            &destination,
        ))
        .unwrap();
    let (events, err) = collect(stream).await;

    assert!(err.is_none(), "{err:?}");
    assert_eq!(
        events[0],
        DownloadEvent::Started {
            resumed_bytes: 1_000,
            total_bytes: 3_000
        }
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn server_ignoring_range_restarts_exactly_once() {
    let server = MockServer::start().await;
    let data = sample_bytes(2_048);
    Mock::given(method("GET"))
        .and(path("/model.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("model.gguf");
    std::fs::write(dir.path().join("model.gguf.part"), b"stale bytes").unwrap();

    let manager = manager(512);
    let stream = manager
        .start_download(DownloadRequest::new(
            "model",
            format!("{}/model.gguf", server.uri()),
            &destination,
        ))
        .unwrap();
    let (events, err) = collect(stream).await;

    assert!(err.is_none(), "{err:?}");
    assert_eq!(
        events[0],
        DownloadEvent::Started {
            resumed_bytes: 0,
            total_bytes: 2_048
        }
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);

    let requests: Vec<Request> = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].headers.contains_key("range"));
    assert!(!requests[1].headers.contains_key("range"));
    server.verify().await;
}

#[tokio::test]
async fn partial_content_at_the_wrong_offset_restarts_from_zero() {
    let server = MockServer::start().await;
    let data = sample_bytes(3_000);
    Mock::given(method("GET"))
        .and(path("/model.gguf"))
        .and(header("range", "bytes=1000-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-2999/3000")
                .set_body_bytes(data.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/model.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("model.gguf");
    std::fs::write(dir.path().join("model.gguf.part"), &data[..1_000]).unwrap();

    let manager = manager(1024);
    let stream = manager
        .start_download(DownloadRequest::new(
            "model",
            format!("{}/model.gguf", server.uri()),
            &destination,
        ))
        .unwrap();
    let (events, err) = collect(stream).await;

    assert!(err.is_none(), "{err:?}");
    assert_monotonic(&events);
    assert_eq!(
        events[0],
        DownloadEvent::Started {
            resumed_bytes: 0,
            total_bytes: 3_000
        }
    );
    assert_eq!(
        events.last(),
        Some(&DownloadEvent::Completed {
            destination: destination.clone(),
            total_bytes: 3_000
        })
    );
    assert_eq!(std::fs::read(&destination).unwrap(), data);
    server.verify().await;
}

#[tokio::test]
async fn unsatisfiable_range_restarts_from_zero() {
    let server = MockServer::start().await;
    let data = sample_bytes(100);
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .and(header_exists("range"))
        .respond_with(ResponseTemplate::new(416))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("a.bin");
    std::fs::write(dir.path().join("a.bin.part"), vec![1u8; 400]).unwrap();

    let manager = manager(64);
    let stream = manager
        .start_download(DownloadRequest::new(
            "a",
            format!("{}/a.bin", server.uri()),
            &destination,
        ))
        .unwrap();
    let (_, err) = collect(stream).await;

    assert!(err.is_none(), "{err:?}");
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(64);
    let stream = manager
        .start_download(DownloadRequest::new(
            "a",
            format!("{}/missing.bin", server.uri()),
            dir.path().join("missing.bin"),
        ))
        .unwrap();
    let (events, err) = collect(stream).await;

    assert!(events.is_empty());
    assert!(matches!(
        err,
        Some(DownloadError::InvalidStatus { status: 404, .. })
    ));
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dir = TempDir::new().unwrap();
    let manager = manager(64);
    let stream = manager
        .start_download(DownloadRequest::new(
            "a",
            format!("http://127.0.0.1:{port}/a.bin"),
            dir.path().join("a.bin"),
        ))
        .unwrap();
    let (_, err) = collect(stream).await;

    let err = err.expect("transport failure");
    assert!(matches!(err, DownloadError::Unavailable(_)));
    assert!(err.is_transient());
}
