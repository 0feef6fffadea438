/// Integration tests for the orchestrator
///
/// These tests verify end-to-end functionality of:
/// - Startup refusing invalid configuration
/// - A scheduled job writing its series file and registry entry
/// - Reported transitions landing in the event log
use crate::config::{Config, MonitorSettings, ServiceConfig, Storage};
use crate::database::EventLog;
use crate::monitoring::FirstContact;
use crate::monitoring::types::{ServiceState, Status};
use crate::orchestrator::Orchestrator;
use crate::pool::open_pool;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

fn test_config(dir: &Path, port: u16) -> Config {
    Config {
        storage: Storage { rrd_dir: dir.join("rrd"), database: dir.join("registry.db") },
        monitor: MonitorSettings { timeout_seconds: 2, interval_seconds: 60, first_contact: FirstContact::Report },
        services: vec![ServiceConfig {
            name: "smtp-banner".into(),
            host_id: 3,
            sysname: "mx.example.org".into(),
            address: "127.0.0.1".into(),
            kind: "tcp".into(),
            port: Some(port),
            service_id: Some(12),
            interval_seconds: None,
            timeout_seconds: None,
            args: Default::default(),
        }],
    }
}

/// Listener that greets every connection with an SMTP banner
async fn banner_server() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(b"220 mx.example.org ESMTP\r\n").await;
        }
    });
    Ok(port)
}

#[tokio::test]
async fn test_invalid_config_stops_before_opening_storage() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path(), 25);
    config.services[0].kind = "imap".into();
    config.services[0].args.insert("auth".into(), "yes".into());

    let err = match Orchestrator::new(config).await {
        Ok(_) => panic!("startup should fail"),
        Err(e) => e,
    };
    assert!(format!("{err:#}").contains("username"));
    assert!(!dir.path().join("registry.db").exists());
    Ok(())
}

#[tokio::test]
async fn test_scheduled_job_records_series_and_event() -> Result<()> {
    let dir = tempdir()?;
    let port = banner_server().await?;
    let config = test_config(dir.path(), port);

    let mut orchestrator = Orchestrator::new(config).await?;
    orchestrator.run_until(tokio::time::sleep(Duration::from_millis(1500))).await?;

    assert!(dir.path().join("rrd/mx.example.org.12.rrd").exists());

    let pool = open_pool(&dir.path().join("registry.db"), 1).await?;
    let events = EventLog::new(pool).recent("smtp-banner", 10).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].prior, ServiceState::Unknown);
    assert_eq!(events[0].state, Status::Up);
    assert_eq!(events[0].diagnostic, "220 mx.example.org ESMTP");
    Ok(())
}

#[tokio::test]
async fn test_empty_config_runs_and_stops() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path(), 25);
    config.services.clear();

    let mut orchestrator = Orchestrator::new(config).await?;
    orchestrator.run_until(async {}).await?;
    assert!(dir.path().join("registry.db").exists());
    Ok(())
}
