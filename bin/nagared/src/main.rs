use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::filter::LevelFilter;

use nagare::{
    serve,
    shaper::{Shaper, ShaperConfig},
    Media, ShapingState,
};
use nagare_quinn::{accept_session, Endpoint, EndpointConfig};

#[derive(Parser)]
#[clap(author, version, about = "Live fMP4 origin server over WebTransport")]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:4443")]
    addr: SocketAddr,

    /// TLS certificate chain, PEM.
    #[clap(long)]
    tls_cert: PathBuf,

    /// TLS private key, PKCS#8 PEM.
    #[clap(long)]
    tls_key: PathBuf,

    /// Directory for qlog traces. Accepted for compatibility; not wired.
    #[clap(long)]
    log_dir: Option<PathBuf>,

    /// DASH manifest of the asset to replay.
    #[clap(long, default_value = "../media/fragmented.mpd")]
    dash: PathBuf,

    /// Shaping profile of `rate <kbps>` / `wait <seconds>` lines; enables
    /// the shaping loop.
    #[clap(long)]
    tc_profile: Option<PathBuf>,

    /// Command that removes the applied throttle.
    #[clap(long, default_value = "tc_scripts/tc_reset.sh")]
    tc_reset_command: PathBuf,

    /// Command that applies a throttle; receives the rate in Mbps.
    #[clap(long, default_value = "tc_scripts/throttle.sh")]
    tc_throttle_command: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.log_dir.is_some() {
        tracing::warn!("--log-dir is accepted but qlog tracing is not wired");
    }

    let media = Arc::new(
        Media::open(&args.dash)
            .await
            .with_context(|| format!("failed to open media: {}", args.dash.display()))?,
    );
    let state = Arc::new(ShapingState::new());

    let endpoint = Endpoint::new(EndpointConfig {
        addr: args.addr,
        cert: args.tls_cert,
        key: args.tls_key,
    })
    .context("failed to create endpoint")?;

    tracing::info!(addr = %endpoint.local_addr()?, "listening");

    let shaper = args.tc_profile.map(|profile| {
        let shaper = Shaper::new(
            ShaperConfig {
                profile,
                reset_command: args.tc_reset_command,
                throttle_command: args.tc_throttle_command,
            },
            state.clone(),
        );

        // A shaper failure stops shaping; sessions carry on unshaped.
        tokio::spawn(async move {
            if let Err(err) = shaper.run().await {
                tracing::error!(error = %err, "shaping loop terminated");
            }
        })
    });

    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            conn = endpoint.accept() => {
                let Some(conn) = conn else { break };
                let media = media.clone();
                let state = state.clone();

                sessions.spawn(async move {
                    match accept_session(conn).await {
                        Ok(session) => {
                            // serve() already closed the transport with the
                            // outcome; nothing left to do either way.
                            let _ = serve(session, media, state).await;
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to accept session"),
                    }
                });
            }
            Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                res.expect("session task panicked");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    endpoint.close();

    // Give in-flight sessions a moment to wind down before exiting.
    let drain = async {
        while sessions.join_next().await.is_some() {}
        endpoint.wait_idle().await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("forcing shutdown with sessions still active");
    }

    if let Some(shaper) = shaper {
        shaper.abort();
    }

    Ok(())
}
