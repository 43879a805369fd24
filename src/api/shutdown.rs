// Graceful shutdown on process signals
//
// The server runs with `disable_signals()`; these tasks take over. In-flight
// proof searches are cancelled before the graceful stop starts waiting on them.

use std::future::Future;
use std::io;

use actix_web::dev::ServerHandle;
use log::{info, warn};

use crate::blockchain::CancelToken;

/// Waits for `signal` and, if it fires, cancels mining and stops the server.
///
/// # Arguments
///
/// * `signal` - Resolves to true when the signal arrived, false if listening failed
/// * `name` - Signal name for the log
/// * `mining` - Token shared with mining requests
/// * `handle` - Handle of the running server
pub async fn stop_on_signal<F>(
    signal: F,
    name: &'static str,
    mining: CancelToken,
    handle: ServerHandle,
) where
    F: Future<Output = bool>,
{
    if !signal.await {
        warn!("Stopped listening for {}", name);
        return;
    }

    info!("{} received, cancelling mining and stopping the server", name);
    mining.cancel();
    handle.stop(true).await;
}

/// Spawns the Ctrl-C and (on unix) SIGTERM listeners
pub fn install_signal_handlers(mining: CancelToken, handle: ServerHandle) -> io::Result<()> {
    #[cfg(unix)]
    {
        use actix_web::rt::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        actix_web::rt::spawn(stop_on_signal(
            async move { terminate.recv().await.is_some() },
            "SIGTERM",
            mining.clone(),
            handle.clone(),
        ));
    }

    actix_web::rt::spawn(stop_on_signal(
        async { actix_web::rt::signal::ctrl_c().await.is_ok() },
        "Ctrl-C",
        mining,
        handle,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpServer};

    fn idle_server() -> actix_web::dev::Server {
        HttpServer::new(App::new)
            .workers(1)
            .disable_signals()
            .bind(("127.0.0.1", 0))
            .unwrap()
            .run()
    }

    #[actix_web::test]
    async fn test_signal_cancels_mining_and_stops_server() {
        let server = idle_server();
        let handle = server.handle();
        let running = actix_web::rt::spawn(server);
        let mining = CancelToken::new();

        stop_on_signal(async { true }, "SIGTERM", mining.clone(), handle).await;

        running.await.unwrap().unwrap();
        assert!(mining.is_cancelled());
    }

    #[actix_web::test]
    async fn test_failed_listener_leaves_server_running() {
        let server = idle_server();
        let handle = server.handle();
        let running = actix_web::rt::spawn(server);
        let mining = CancelToken::new();

        stop_on_signal(async { false }, "SIGTERM", mining.clone(), handle.clone()).await;
        assert!(!mining.is_cancelled());

        handle.stop(true).await;
        running.await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn test_install_signal_handlers() {
        let server = idle_server();
        let handle = server.handle();
        let running = actix_web::rt::spawn(server);

        install_signal_handlers(CancelToken::new(), handle.clone()).unwrap();

        handle.stop(true).await;
        running.await.unwrap().unwrap();
    }
}
