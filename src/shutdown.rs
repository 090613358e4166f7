use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The publisher derives each job's abort signal from this token, so a
/// signal stops running jobs after their in-flight documents and sends them
/// through the normal failure path.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Could not install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, aborting running job");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, aborting running job");
            }
        }

        trigger.cancel();
    });

    token
}
