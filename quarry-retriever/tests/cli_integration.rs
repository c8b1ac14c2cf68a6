use anyhow::Result;
use quarry_retriever::config::StorageConfig;
use quarry_retriever::indexing::{DocumentIndexer, ParsedDocument};
use quarry_retriever::storage::{RuntimeCapabilities, StorageFactory};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to run the CLI binary against `temp_dir`
fn run_cli(temp_dir: &TempDir, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_quarry"))
        .arg("--data-dir")
        .arg(temp_dir.path())
        .args(args)
        .env("QUARRY_LOG", "error")
        .output()?;
    Ok(output)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Helper to populate a database with test data
async fn populate_test_data(temp_dir: &TempDir) -> Result<()> {
    let opened = StorageFactory::new()
        .open(&StorageConfig::new(temp_dir.path()), RuntimeCapabilities::native())
        .await?;
    let indexer = DocumentIndexer::new(opened.adapter.clone());
    indexer
        .index_document(ParsedDocument::from_passages(
            "/notes/taxes.txt",
            "a1",
            &["File the quarterly tax return by April.", "Keep receipts for five years."],
        ))
        .await?;
    indexer
        .index_document(ParsedDocument::from_passages(
            "/notes/garden.md",
            "b2",
            &["Water the tomatoes every morning."],
        ))
        .await?;
    opened.adapter.close().await?;
    Ok(())
}

#[test]
fn test_cli_init_and_info() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let output = run_cli(&temp_dir, &["init", "--options", r#"{"backend":"sqlite","distance_metric":"dot"}"#])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Created sqlite database"));
    assert!(temp_dir.path().join("quarry.meta.json").exists());

    let output = run_cli(&temp_dir, &["init"])?;
    assert!(stdout(&output).contains("Opened existing sqlite database"));

    let output = run_cli(&temp_dir, &["--format", "json", "info"])?;
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(info["metadata"]["backend"], "sqlite");
    assert_eq!(info["metadata"]["backend_options"]["distance_metric"], "dot");
    let backends = info["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 4);
    Ok(())
}

#[test]
fn test_cli_rejects_bad_options() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let output = run_cli(
        &temp_dir,
        &["init", "--options", r#"{"backend":"sqlite","distance_metric":"manhattan"}"#],
    )?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("distance_metric"));
    assert!(!temp_dir.path().join("quarry.meta.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_cli_search_and_stats() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate_test_data(&temp_dir).await?;

    let output = run_cli(&temp_dir, &["search", "quarterly tax"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("Found 1 results"), "{text}");
    assert!(text.contains("/notes/taxes.txt"));

    let output = run_cli(&temp_dir, &["--format", "json", "search", "tomatoes", "--file-type", "md"])?;
    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(response["strategy"], "keyword");
    assert_eq!(response["results"][0]["file_name"], "garden.md");

    let output = run_cli(&temp_dir, &["--format", "json", "stats"])?;
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stats["documents"], 2);
    assert_eq!(stats["chunks"], 3);
    Ok(())
}

#[test]
fn test_cli_queue_config_and_sql() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let output = run_cli(&temp_dir, &["queue", "add", "/a.txt", "/b.txt", "--priority", "high"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let output = run_cli(&temp_dir, &["--format", "json", "queue"])?;
    let status: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["pending"], 2);
    assert_eq!(status["by_priority"]["high"], 2);

    let output = run_cli(&temp_dir, &["config", "set", "last_scan", "2026-01-01"])?;
    assert!(output.status.success());
    let output = run_cli(&temp_dir, &["config", "get", "last_scan"])?;
    assert_eq!(stdout(&output).trim(), "2026-01-01");

    let output = run_cli(
        &temp_dir,
        &["--format", "json", "sql", "SELECT file_path FROM queue_items WHERE file_path = ?", "/b.txt"],
    )?;
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(rows[0]["file_path"], "/b.txt");

    let output = run_cli(&temp_dir, &["queue", "clear"])?;
    assert!(stdout(&output).contains("Removed 2 items"));
    Ok(())
}
