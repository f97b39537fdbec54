//! Integration tests for the fetch primitive.
//!
//! These tests drive `HttpClient` against mock servers: the retry ladder,
//! bypass escalation, disguised error pages and cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use book_downloader_core::bypass::{BypasserKind, BypassSettings, ExternalSettings};
use book_downloader_core::download::{DownloadError, HttpClient, RetryPolicy};
use book_downloader_core::CancelToken;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

fn fast_policy(max_retry: u32) -> RetryPolicy {
    RetryPolicy::new(max_retry, Duration::from_millis(5))
}

fn no_progress(_: f64) {}

#[tokio::test]
async fn test_fetch_page_not_found_is_not_retried() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = HttpClient::without_bypass(fast_policy(5)).expect("client");
    let url = format!("{}/missing", mock_server.uri());
    let err = client.try_fetch_page(&url, false).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    // One request per call: a 404 is never retried.
    assert_eq!(client.fetch_page(&url, false).await, "", "fetch_page swallows errors");
}

#[tokio::test]
async fn test_fetch_page_transient_failure_uses_whole_budget() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = HttpClient::without_bypass(fast_policy(2)).expect("client");
    let url = format!("{}/flaky", mock_server.uri());
    let err = client.try_fetch_page(&url, false).await.unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn test_fetch_page_recovers_after_transient_failure() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/recover"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/recover"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>results</html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpClient::without_bypass(fast_policy(3)).expect("client");
    let page = client
        .fetch_page(&format!("{}/recover", mock_server.uri()), false)
        .await;
    assert_eq!(page, "<html>results</html>");
}

#[tokio::test]
async fn test_fetch_page_forbidden_escalates_to_external_bypasser() {
    let Some(site) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(solver) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/md5/abc"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&site)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .and(body_partial_json(json!({ "cmd": "request.get" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "message": "",
            "solution": { "response": "<html>solved</html>" }
        })))
        .expect(1)
        .mount(&solver)
        .await;

    let bypasser = BypasserKind::External
        .build(&BypassSettings {
            external: ExternalSettings {
                url: solver.uri(),
                path: "/v1".to_string(),
                timeout: Duration::from_secs(5),
            },
            ..BypassSettings::default()
        })
        .expect("bypasser");
    let client = HttpClient::new(fast_policy(3), bypasser).expect("client");

    let page = client
        .try_fetch_page(&format!("{}/md5/abc", site.uri()), false)
        .await
        .expect("page through solver");
    assert_eq!(page, "<html>solved</html>");
}

#[tokio::test]
async fn test_bypasser_failures_stay_on_bypasser_ladder() {
    let Some(site) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(solver) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/md5/abc"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&site)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&solver)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "message": "",
            "solution": { "response": "<html>third time</html>" }
        })))
        .expect(1)
        .mount(&solver)
        .await;

    let bypasser = BypasserKind::External
        .build(&BypassSettings {
            external: ExternalSettings {
                url: solver.uri(),
                path: "/v1".to_string(),
                timeout: Duration::from_secs(5),
            },
            ..BypassSettings::default()
        })
        .expect("bypasser");
    let client = HttpClient::new(fast_policy(3), bypasser).expect("client");

    let page = client
        .try_fetch_page(&format!("{}/md5/abc", site.uri()), false)
        .await
        .expect("page through solver");
    assert_eq!(page, "<html>third time</html>");
}

#[tokio::test]
async fn test_forbidden_without_bypasser_stays_on_plain_ladder() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/walled"))
        .respond_with(ResponseTemplate::new(403))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = HttpClient::without_bypass(fast_policy(2)).expect("client");
    let err = client
        .try_fetch_page(&format!("{}/walled", mock_server.uri()), false)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(403));
}

#[tokio::test]
async fn test_cancel_during_page_backoff_returns_promptly() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let client =
        HttpClient::without_bypass(RetryPolicy::new(5, Duration::from_millis(400))).expect("client");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let url = format!("{}/busy", mock_server.uri());
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        client.try_fetch_page_or_cancel(&url, false, &cancel),
    )
    .await
    .expect("backoff sleep is interrupted");
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(client.fetch_page_or_cancel(&url, false, &cancel).await, "");
}

#[tokio::test]
async fn test_download_rejects_disguised_error_page() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/book.epub"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                "<html>please verify you are human</html>",
                "text/html; charset=utf-8",
            ),
        )
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let dest = temp_dir.path().join("book.epub");
    let client = HttpClient::without_bypass(fast_policy(0)).expect("client");
    let url = format!("{}/book.epub", mock_server.uri());

    let err = client
        .download_to_path(&url, Some(1_200_000), &dest, &no_progress, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::MarkupResponse { .. }), "{err:?}");
    assert!(!dest.exists(), "rejected download must not leave a file");

    let bytes = client
        .fetch_binary(&url, Some(1_200_000), &no_progress, &CancelToken::new())
        .await;
    assert!(bytes.is_none());
}

#[tokio::test]
async fn test_download_streams_file_and_reports_progress() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    let content = vec![7_u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/book.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/pdf")
                .set_body_bytes(content.clone()),
        )
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let dest = temp_dir.path().join("book.pdf");
    let client = HttpClient::without_bypass(fast_policy(0)).expect("client");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        move |percent: f64| seen.lock().unwrap().push(percent)
    };

    let written = client
        .download_to_path(
            &format!("{}/book.pdf", mock_server.uri()),
            None,
            &dest,
            &recorder,
            &CancelToken::new(),
        )
        .await
        .expect("download");
    assert_eq!(written, content.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress is monotonic");
    assert!((seen.last().copied().unwrap() - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_cancelled_token_skips_request() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let dest = temp_dir.path().join("never.bin");
    let client = HttpClient::without_bypass(fast_policy(0)).expect("client");
    let cancel = CancelToken::new();
    cancel.cancel();
    let url = format!("{}/file.bin", mock_server.uri());

    let err = client
        .download_to_path(&url, None, &dest, &no_progress, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!dest.exists());
    assert!(client.fetch_binary(&url, None, &no_progress, &cancel).await.is_none());
}

#[tokio::test]
async fn test_cancel_while_waiting_for_response() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1_u8; 1024])
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&mock_server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let dest = temp_dir.path().join("slow.bin");
    let client = HttpClient::without_bypass(fast_policy(0)).expect("client");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let url = format!("{}/slow.bin", mock_server.uri());
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.download_to_path(&url, None, &dest, &no_progress, &cancel),
    )
    .await
    .expect("download returns promptly once cancelled");
    assert!(result.unwrap_err().is_cancelled());
    assert!(!dest.exists());
}
