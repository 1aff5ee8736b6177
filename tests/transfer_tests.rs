//! Integration tests for the job submission and transfer layer.

use std::time::Duration;

use gridlink::{
    ExecutionStatus, FileSource, GridConnection, JobRequest, JobService, LinkError, PollPolicy,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A connection already authenticated against the mock server.
async fn connected(server: &MockServer) -> GridConnection {
    Mock::given(method("POST"))
        .and(path("/api/access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "at",
            "refreshToken": "rt"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users/limits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;

    let mut conn = GridConnection::with_url(server.uri());
    conn.connect_with_token("seed").await.expect("connect");
    conn
}

fn quick_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

#[tokio::test]
async fn submit_job_returns_the_execution_id() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/request"))
        .and(header("authorization", "Bearer at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "executionRequestId": "exec-42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let job = JobRequest::new("vm-large", "my-job", "demo", 300)
        .with_bytes("input.json", b"{}".to_vec());
    let id = conn.submit_job(job).await.expect("submit");
    assert_eq!(id, "exec-42");
}

#[tokio::test]
async fn submit_job_streams_attachments_from_disk() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("circuit.bin");
    std::fs::write(&input, b"payload").unwrap();

    Mock::given(method("POST"))
        .and(path("/api/request"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "executionRequestId": "exec-7"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let job = JobRequest::new("vm-small", "disk-job", "demo", 60).with_file(&input);
    assert_eq!(conn.submit_job(job).await.unwrap(), "exec-7");
}

#[tokio::test]
async fn submit_job_non_200_is_an_upload_error() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/request"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({"message": "queue full"})),
        )
        .mount(&server)
        .await;

    let job = JobRequest::new("vm-large", "my-job", "demo", 300);
    let err = conn.submit_job(job).await.unwrap_err();
    match err {
        LinkError::Upload { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "queue full");
        }
        other => panic!("expected Upload, got {other:?}"),
    }
}

#[tokio::test]
async fn request_info_parses_the_server_record() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .and(header("authorization", "Bearer at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "name": "my-job",
            "label": "demo",
            "status": "RUNNING",
            "numberOfUploadedFiles": 2
        })))
        .mount(&server)
        .await;

    let info = conn.request_info("exec-1").await.unwrap();
    assert_eq!(info.id, "exec-1");
    assert_eq!(info.status, ExecutionStatus::Running);
    assert_eq!(info.uploaded_files, 2);
}

#[tokio::test]
async fn list_requests_passes_filters_as_query_params() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/request"))
        .and(query_param("status", "RUNNING"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "executions": {"docs": [
                {"_id": "a", "status": "RUNNING"},
                {"_id": "b", "status": "RUNNING"}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let listed = conn
        .list_requests(&[("status", "RUNNING"), ("limit", "10")])
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, "a");
}

#[tokio::test]
async fn stop_and_delete_are_empty_posts() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/stop-execution/exec-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/delete-files/exec-1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    conn.stop_execution("exec-1").await.unwrap();
    let err = conn.delete_files("exec-1").await.unwrap_err();
    assert!(matches!(err, LinkError::Request { status: 404, .. }));
}

#[tokio::test]
async fn download_file_writes_the_named_file() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .and(query_param("source", "results"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="out.bin""#)
                .set_body_bytes(b"RESULT".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dest = dir.path().join("results");
    let name = conn
        .download_file("exec-1", 0, FileSource::Results, &dest)
        .await
        .unwrap();
    assert_eq!(name, "out.bin");
    assert_eq!(std::fs::read(dest.join("out.bin")).unwrap(), b"RESULT");
}

#[tokio::test]
async fn download_file_without_filename_is_a_protocol_error() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RESULT".to_vec()))
        .mount(&server)
        .await;

    let err = conn
        .download_file("exec-1", 0, FileSource::Results, dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Protocol(_)));
}

#[tokio::test]
async fn download_file_retries_while_the_server_reports_pending() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    // Two pending responses, then the file.
    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="late.bin""#)
                .set_body_bytes(b"LATE".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let name = conn
        .download_file_with_policy(
            "exec-1",
            0,
            FileSource::Results,
            dir.path(),
            &quick_policy(5),
        )
        .await
        .unwrap();
    assert_eq!(name, "late.bin");
}

#[tokio::test]
async fn download_file_pending_forever_times_out() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .respond_with(ResponseTemplate::new(202))
        .expect(2)
        .mount(&server)
        .await;

    let err = conn
        .download_file_with_policy(
            "exec-1",
            0,
            FileSource::Results,
            dir.path(),
            &quick_policy(2),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Timeout(_)));
}

#[tokio::test]
async fn download_files_fetches_every_index_in_order() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "DONE",
            "numberOfResultedFiles": 3
        })))
        .mount(&server)
        .await;
    for index in 0..3 {
        Mock::given(method("GET"))
            .and(path(format!("/api/files/exec-1/{index}")))
            .and(query_param("source", "results"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "content-disposition",
                        format!(r#"attachment; filename="res-{index}.dat""#).as_str(),
                    )
                    .set_body_bytes(vec![index as u8]),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let names = conn
        .download_files("exec-1", FileSource::Results, Some(dir.path()))
        .await
        .unwrap();
    assert_eq!(names, vec!["res-0.dat", "res-1.dat", "res-2.dat"]);
}

#[tokio::test]
async fn download_files_aborts_after_the_first_failure() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "DONE",
            "numberOfResultedFiles": 3
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/0"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="ok.dat""#)
                .set_body_bytes(b"OK".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;
    // Second file violates the contract: no Content-Disposition.
    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BAD".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/files/exec-1/2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = conn
        .download_files("exec-1", FileSource::Results, Some(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Protocol(_)));
}

#[tokio::test]
async fn status_predicates_refetch_the_record() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "ERROR"
        })))
        .expect(4)
        .mount(&server)
        .await;

    assert!(conn.is_done("exec-1").await.unwrap());
    assert!(conn.is_failed("exec-1").await.unwrap());
    assert!(conn.is_started("exec-1").await.unwrap());
    assert!(!conn.is_canceled("exec-1").await.unwrap());
}

#[tokio::test]
async fn wait_for_completion_polls_until_terminal() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "RUNNING"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "DONE"
        })))
        .mount(&server)
        .await;

    let info = conn
        .wait_for_completion("exec-1", &quick_policy(5))
        .await
        .unwrap();
    assert_eq!(info.status, ExecutionStatus::Done);
}

#[tokio::test]
async fn wait_for_completion_times_out_on_a_stuck_job() {
    let server = MockServer::start().await;
    let conn = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/request/exec-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;

    let err = conn
        .wait_for_completion("exec-1", &quick_policy(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Timeout(_)));
}
