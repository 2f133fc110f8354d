use crate::infrastructure::{ProcessTestHarness, SocketTestUtils};
use anyhow::Result;
use std::time::Duration;

#[tokio::test]
async fn test_connect_timeout_is_fatal() -> Result<()> {
    let harness = ProcessTestHarness::new()?;
    let address = SocketTestUtils::closed_address().await?;

    let output = harness
        .run(
            &["--host", address.as_str(), "--connect-timeout", "200ms"],
            Duration::from_secs(10),
        )
        .await?;

    assert!(!output.status.success());
    assert!(output.stderr.contains("Timed out connecting"), "{}", output.stderr);
    assert!(output.runtime >= Duration::from_millis(200));
    Ok(())
}

#[tokio::test]
async fn test_malformed_selection_is_rejected() -> Result<()> {
    let harness = ProcessTestHarness::new()?;

    let output = harness
        .run(&["--select", "3-1"], Duration::from_secs(10))
        .await?;

    assert!(!output.status.success());
    assert!(output.stderr.contains("Invalid range '3-1'"), "{}", output.stderr);
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_selection_is_rejected() -> Result<()> {
    let harness = ProcessTestHarness::new()?;
    let dir = harness.message_dir(&[("only", &b"NOOP\r\n"[..])])?;

    let output = harness
        .run(
            &["--messages", dir.to_str().unwrap(), "--select", "0-1"],
            Duration::from_secs(10),
        )
        .await?;

    assert!(!output.status.success());
    assert!(output.stderr.contains("only 1 messages are loaded"), "{}", output.stderr);
    Ok(())
}

#[tokio::test]
async fn test_unreadable_message_directory_is_rejected() -> Result<()> {
    let harness = ProcessTestHarness::new()?;

    let output = harness
        .run(&["--messages", "/nonexistent/messages"], Duration::from_secs(10))
        .await?;

    assert!(!output.status.success());
    assert!(output.stderr.contains("Failed to read message directory"), "{}", output.stderr);
    Ok(())
}

#[tokio::test]
async fn test_invalid_duration_is_rejected() -> Result<()> {
    let harness = ProcessTestHarness::new()?;

    let output = harness
        .run(&["--sleep", "soon"], Duration::from_secs(10))
        .await?;

    assert!(!output.status.success());
    assert!(output.stderr.contains("--sleep"), "{}", output.stderr);
    Ok(())
}
