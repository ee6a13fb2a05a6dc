//! MCP tool surface tests over an empty project: handshake-free, in-process
//! calls against the tool handlers.

use clangmap::config::Settings;
use clangmap::mcp::*;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::RawContent;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn text_of(result: &rmcp::model::CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(text) => Some(text.text.clone()),
            _ => None,
        })
        .collect()
}

fn test_settings(temp: &TempDir) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.cache_root = temp.path().join("cache");
    Arc::new(settings)
}

#[tokio::test]
async fn status_before_any_project_is_uninitialized() {
    let temp = TempDir::new().unwrap();
    let server = CodeIndexServer::new(test_settings(&temp));

    let result = server
        .get_indexing_status(Parameters(EmptyRequest {}))
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&text_of(&result)).unwrap();
    assert_eq!(body["state"], "uninitialized");
}

#[tokio::test]
async fn set_project_then_query_empty_results() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let server = CodeIndexServer::new(test_settings(&temp));

    let result = server
        .set_project_directory(Parameters(SetProjectRequest {
            path: project.to_string_lossy().into_owned(),
        }))
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&text_of(&result)).unwrap();
    assert_eq!(body["indexing_scheduled"], true);

    // The empty project indexes in well under a second; poll the
    // non-blocking status tool until it lands.
    let mut state = String::new();
    for _ in 0..50 {
        let status = server
            .get_indexing_status(Parameters(EmptyRequest {}))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&text_of(&status)).unwrap();
        state = body["state"].as_str().unwrap_or_default().to_string();
        if state == "indexed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, "indexed");

    // The status flips to indexed just before the background thread drops
    // the indexer lock; retry through that window.
    let mut body = serde_json::Value::Null;
    for _ in 0..50 {
        let result = server
            .search_classes(Parameters(SearchClassesRequest {
                pattern: ".".into(),
                project_only: false,
                kind: None,
            }))
            .await
            .unwrap();
        body = serde_json::from_str(&text_of(&result)).unwrap();
        if body.get("error_kind").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn invalid_regex_reports_query_error() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let server = CodeIndexServer::new(test_settings(&temp));
    server
        .set_project_directory(Parameters(SetProjectRequest {
            path: project.to_string_lossy().into_owned(),
        }))
        .await
        .unwrap();
    // Wait out the background pass so the query lock is free.
    for _ in 0..50 {
        let status = server
            .get_indexing_status(Parameters(EmptyRequest {}))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&text_of(&status)).unwrap();
        if body["state"] == "indexed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut body = serde_json::Value::Null;
    for _ in 0..50 {
        let result = server
            .search_classes(Parameters(SearchClassesRequest {
                pattern: "[unclosed".into(),
                project_only: false,
                kind: None,
            }))
            .await
            .unwrap();
        body = serde_json::from_str(&text_of(&result)).unwrap();
        if result.is_error == Some(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(body["error_kind"], "query_error");
}

#[tokio::test]
async fn cross_references_answer_deprecation() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let server = CodeIndexServer::new(test_settings(&temp));
    server
        .set_project_directory(Parameters(SetProjectRequest {
            path: project.to_string_lossy().into_owned(),
        }))
        .await
        .unwrap();
    for _ in 0..50 {
        let status = server
            .get_indexing_status(Parameters(EmptyRequest {}))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&text_of(&status)).unwrap();
        if body["state"] == "indexed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut body = serde_json::Value::Null;
    for _ in 0..50 {
        let result = server
            .get_cross_references(Parameters(NameRequest {
                name: "Widget".into(),
            }))
            .await
            .unwrap();
        body = serde_json::from_str(&text_of(&result)).unwrap();
        if body.get("note").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(body["references"], serde_json::json!([]));
    assert!(body["note"].as_str().unwrap().contains("deprecated"));
}
