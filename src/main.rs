mod archive;
mod config;
mod fetcher;
mod instance;
mod ipc;
mod manager;
mod process_monitor;
mod supervisor;
mod utils;

use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("warden-core daemon starting");

    let global = config::GlobalConfig::load();
    let manager = Arc::new(manager::ServerManager::new(&global));
    manager.initialize().await?;

    // 백그라운드 감시 태스크 — 워처가 놓친 프로세스 종료를 정리
    let sweeper = manager.clone();
    tokio::spawn(async move {
        let mut error_count = 0u32;
        let max_consecutive_errors = 10;

        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

            match sweeper.reap_exited().await {
                Ok(_) => {
                    if error_count > 0 {
                        tracing::info!("Sweep recovered after {} errors", error_count);
                    }
                    error_count = 0;
                }
                Err(e) => {
                    error_count += 1;
                    if error_count <= 3 || error_count % 10 == 0 {
                        tracing::error!("Sweep error (count: {}): {}", error_count, e);
                    }
                    if error_count >= max_consecutive_errors {
                        tracing::error!(
                            "Sweep has failed {} consecutive times, resetting counter",
                            error_count
                        );
                        error_count = 0;
                    }
                }
            }
        }
    });

    // Graceful shutdown: Ctrl+C 시 실행 중인 서버를 모두 정지
    let shutdown_manager = manager.clone();
    let graceful = global.graceful_timeout();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping all instances...");
        shutdown_manager.shutdown_all(Some(graceful)).await;
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = ipc::IpcServer::new(manager.clone(), &global.listen_addr());
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("warden-core daemon shutting down");
    Ok(())
}
