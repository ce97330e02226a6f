use clap::Parser;
use sra_session::{Config, Error, LoginResult, SessionClient, telemetry};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, leaving session in place");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, leaving session in place");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = sra_session::config::Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!(config = ?args.config, "Loaded configuration");

    let client = SessionClient::new(&config);
    let session = client.manager();
    let mut notices = session.notices();
    let mut state = session.subscribe();

    let restored = session.bootstrap().await;
    tracing::info!(phase = %restored.phase, "Bootstrap finished");

    if args.logout {
        session.logout().await?;
        println!("Signed out.");
        return Ok(());
    }

    if !restored.session_valid() {
        if let Some(username) = args.username.as_deref() {
            let password = args
                .password
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("SRA_PASSWORD must be set to sign in as {username}"))?;
            match session
                .login(username, password, args.mfa_code.as_deref())
                .await
                .and_then(LoginResult::into_user)
            {
                Ok(user) => println!("Signed in as {} ({})", user.username, user.role.name),
                Err(Error::SecondFactorRequired) => {
                    println!("A verification code is required; run again with --mfa-code.");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Sign-in failed");
                    anyhow::bail!(e.user_message());
                }
            }
        } else {
            println!("No session. Pass --username to sign in.");
            return Ok(());
        }
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                println!("session: {}", snapshot.phase);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("notice: {}", notice.message()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notice listener fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
