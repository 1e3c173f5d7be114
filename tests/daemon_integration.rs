//! End-to-end lifecycle tests against a scripted stand-in server process.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use warden_core::config::GlobalConfig;
use warden_core::instance::InstanceRecord;
use warden_core::manager::error::ManagerError;
use warden_core::manager::{InstallSource, InstallStatus, RegisterSpec, ServerEvent, ServerManager};
use warden_core::supervisor::state_machine::State;
use warden_core::supervisor::ProcessStatus;

/// Behaves like a Minecraft server as far as the supervisor cares: prints a
/// startup line, echoes commands, exits 0 on `stop`.
const FAKE_SERVER: &str = r#"#!/bin/sh
echo "[12:00:00] [Server thread/INFO]: Starting fake server"
while read line; do
  if [ "$line" = "stop" ]; then
    echo "[12:00:00] [Server thread/INFO]: Stopping the server"
    exit 0
  fi
  echo "[12:00:00] [Server thread/INFO]: got: $line"
done
"#;

const CRASHING_SERVER: &str = "#!/bin/sh\nsleep 0.2\nexit 3\n";

async fn setup(dir: &Path) -> Arc<ServerManager> {
    let global = GlobalConfig {
        data_dir: Some(dir.to_string_lossy().to_string()),
        ..Default::default()
    };
    let manager = Arc::new(ServerManager::new(&global));
    manager.initialize().await.unwrap();
    manager
}

/// Register an instance whose "java" is a shell script.
async fn register_scripted(
    manager: &ServerManager,
    name: &str,
    port: u16,
    script: &str,
) -> InstanceRecord {
    let record = manager
        .register(RegisterSpec {
            name: name.to_string(),
            working_dir: None,
            port: Some(port),
            version: None,
            description: None,
            accept_eula: true,
        })
        .await
        .unwrap();

    let dir = record.working_dir_path();
    let script_path = dir.join("fake-server.sh");
    std::fs::write(&script_path, script).unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut cfg = manager.get_config(&record.id).await.unwrap();
    cfg.set("java-executable", script_path.to_string_lossy());
    manager.put_config(&record.id, &cfg).await.unwrap();
    record
}

async fn wait_for_state(manager: &ServerManager, id: &str, want: State) {
    for _ in 0..100 {
        if manager.status(id).await.unwrap().state == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "instance never reached {:?}, stuck at {:?}",
        want,
        manager.status(id).await.unwrap().state
    );
}

#[tokio::test]
async fn test_full_lifecycle_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "survival", 25565, FAKE_SERVER).await;

    // register → start → running
    let pid = manager.start(&record.id).await.unwrap();
    assert!(pid > 0);
    let status = manager.status(&record.id).await.unwrap();
    assert_eq!(status.state, State::Running);
    assert_eq!(status.process, Some(ProcessStatus::Running));
    assert_eq!(status.port, Some(25565));

    // console command reaches the process
    manager.send_command(&record.id, "say hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let lines = manager.recent_console(&record.id, 100).await.unwrap();
    assert!(lines.iter().any(|l| l.content.contains("got: say hello")));

    // graceful stop → exited(0), back to stopped
    let outcome = manager
        .stop(&record.id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(outcome.is_some());

    let status = manager.status(&record.id).await.unwrap();
    assert_eq!(status.state, State::Stopped);
    assert_eq!(status.process, Some(ProcessStatus::Exited(0)));

    println!("✓ full lifecycle scenario passed");
}

#[tokio::test]
async fn test_start_while_running_is_invalid_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "survival", 25600, FAKE_SERVER).await;

    manager.start(&record.id).await.unwrap();
    let err = manager.start(&record.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidState { op: "start", .. }));

    // 실행 중인 프로세스는 하나뿐
    let status = manager.status(&record.id).await.unwrap();
    assert_eq!(status.state, State::Running);

    manager.stop(&record.id, Some(Duration::from_secs(5))).await.unwrap();
    println!("✓ double start rejected");
}

#[tokio::test]
async fn test_crash_is_detected_and_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "flaky", 25601, CRASHING_SERVER).await;

    manager.start(&record.id).await.unwrap();
    wait_for_state(&manager, &record.id, State::Crashed).await;

    // start 는 crashed 상태에서 거부됨
    let err = manager.start(&record.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidState { .. }));

    // stop 으로 정리 후 재시작 가능
    manager.stop(&record.id, None).await.unwrap();
    assert_eq!(
        manager.status(&record.id).await.unwrap().state,
        State::Stopped
    );
    manager.start(&record.id).await.unwrap();
    wait_for_state(&manager, &record.id, State::Crashed).await;

    println!("✓ crash detection and recovery passed");
}

#[tokio::test]
async fn test_events_are_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "survival", 25602, FAKE_SERVER).await;

    let mut events = manager.subscribe();
    manager.start(&record.id).await.unwrap();
    manager
        .stop(&record.id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut saw_started = false;
    let mut saw_stopped = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        match event {
            ServerEvent::Started { pid, .. } => {
                assert!(pid > 0);
                saw_started = true;
            }
            ServerEvent::Stopped { .. } => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_started, "Started event must be broadcast");
    assert!(saw_stopped, "Stopped event must be broadcast");
    println!("✓ lifecycle events broadcast");
}

// ─── Content install ─────────────────────────────────────────

fn build_bundle() -> Vec<u8> {
    use sha2::Digest;
    use std::io::Write;

    let jar = b"fake worldedit jar".to_vec();
    let manifest = format!(
        r#"{{"files":[{{"path":"mods/worldedit.jar","sha256":"{}"}}]}}"#,
        hex::encode(sha2::Sha256::digest(&jar))
    );

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer.start_file("manifest.json", options).unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    writer.start_file("mods/worldedit.jar", options).unwrap();
    writer.write_all(&jar).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn serve_bytes(bytes: Vec<u8>) -> String {
    let app = axum::Router::new().route(
        "/bundle.zip",
        axum::routing::get(move || async move { bytes.clone() }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}/bundle.zip", addr)
}

#[tokio::test]
async fn test_install_content_into_stopped_instance() {
    use sha2::Digest;

    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "survival", 25603, FAKE_SERVER).await;

    let bundle = build_bundle();
    let bundle_sha = hex::encode(sha2::Sha256::digest(&bundle));
    let url = serve_bytes(bundle).await;

    let task = manager
        .install_content(
            &record.id,
            InstallSource {
                url,
                sha256: Some(bundle_sha),
                sha1: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(task.status, InstallStatus::Done);
    assert_eq!(task.files_installed, 1);
    assert!(record
        .working_dir_path()
        .join("mods/worldedit.jar")
        .exists());

    let status = manager.status(&record.id).await.unwrap();
    assert_eq!(status.state, State::Stopped);
    println!("✓ content install passed");
}

#[tokio::test]
async fn test_install_with_corrupted_download_fails_recoverably() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "survival", 25604, FAKE_SERVER).await;

    let url = serve_bytes(b"not the bundle you expected".to_vec()).await;
    let err = manager
        .install_content(
            &record.id,
            InstallSource {
                url,
                sha256: Some("0".repeat(64)),
                sha1: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "HASH_MISMATCH");

    // 실패해도 stopped 로 복귀하고, 작업 기록은 failed
    let status = manager.status(&record.id).await.unwrap();
    assert_eq!(status.state, State::Stopped);
    let last = status.last_install.expect("failed task must be recorded");
    assert_eq!(last.status, InstallStatus::Failed);
    assert!(last.error.is_some());

    // 재시도 가능: 실패 후에도 start 가 동작
    manager.start(&record.id).await.unwrap();
    manager
        .stop(&record.id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    println!("✓ corrupted install recoverable");
}

#[tokio::test]
async fn test_remove_stops_running_instance() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let record = register_scripted(&manager, "doomed", 25605, FAKE_SERVER).await;

    manager.start(&record.id).await.unwrap();
    manager.remove(&record.id).await.unwrap();

    assert!(matches!(
        manager.status(&record.id).await,
        Err(ManagerError::InstanceNotFound(_))
    ));
    println!("✓ remove stops and deregisters");
}

#[tokio::test]
async fn test_shutdown_all_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path()).await;
    let a = register_scripted(&manager, "alpha", 25606, FAKE_SERVER).await;
    let b = register_scripted(&manager, "beta", 25607, FAKE_SERVER).await;

    manager.start(&a.id).await.unwrap();
    manager.start(&b.id).await.unwrap();

    manager.shutdown_all(Some(Duration::from_secs(5))).await;

    assert_eq!(manager.status(&a.id).await.unwrap().state, State::Stopped);
    assert_eq!(manager.status(&b.id).await.unwrap().state, State::Stopped);
    println!("✓ shutdown_all passed");
}

#[tokio::test]
async fn test_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let manager = setup(dir.path()).await;
        let record = register_scripted(&manager, "survival", 25608, FAKE_SERVER).await;
        record.id
    };

    // 새 매니저가 같은 registry 를 로드
    let manager = setup(dir.path()).await;
    let status = manager.status(&id).await.unwrap();
    assert_eq!(status.name, "survival");
    assert_eq!(status.state, State::Stopped);
    println!("✓ registry reload passed");
}
