use crate::{
    cache::SharedCache,
    config::EngineConfig,
    engine::{
        Engine,
        worker::{
            daily_reset::run_daily_reset_worker, flusher::run_account_flusher,
            funding::run_funding_worker, retry::run_retry_worker, run_expiry_worker,
        },
    },
    error::EngineError,
    persistence::Repository,
    server::run_server,
    shutdown::shutdown_channel,
};
use propel_data::{
    FeedEvent, UpstreamEvent,
    binance::{BinanceChannel, combined_stream_url},
    stream::run_feed,
};
use propel_integration::channel::mpsc_unbounded;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Error type for the feed event channel; the receiver outlives every producer in normal
/// operation, so a send failure just means shutdown is underway.
#[derive(Debug, Clone)]
pub struct FeedChannelClosed;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FeedChannelClosed {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self
    }
}

/// A fully wired engine deployment: feed ingress, client channel, periodic workers.
#[derive(Debug)]
pub struct System {
    pub engine: Arc<Engine>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl System {
    /// Build the engine, load state from the store of record, and spawn every long-lived
    /// task.
    pub async fn start(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        cache: Arc<dyn SharedCache>,
    ) -> Result<Self, EngineError> {
        let symbols: Vec<&str> = config.symbols.iter().map(|symbol| symbol.as_str()).collect();
        let ticker_url = combined_stream_url(
            &config.upstream_ws_url,
            BinanceChannel::BOOK_TICKER,
            symbols.iter().copied(),
        )?;
        let depth_url = combined_stream_url(
            &config.upstream_ws_url,
            BinanceChannel::DEPTH_10,
            symbols.iter().copied(),
        )?;

        let engine = Arc::new(Engine::new(config, Arc::clone(&repository), cache));
        engine.load_state().await?;

        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let mut handles = Vec::new();

        // Upstream feeds: book ticker drives execution, depth is display-only
        let (feed_tx, feed_rx) = mpsc_unbounded::<FeedEvent<UpstreamEvent>, FeedChannelClosed>();
        handles.push(tokio::spawn(run_feed(
            ticker_url,
            feed_tx.clone(),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_feed(
            depth_url,
            feed_tx,
            shutdown_rx.clone(),
        )));

        // Feed ingress: ticks are processed to completion (triggers included) in arrival
        // order before the next event is consumed
        let ingress_engine = Arc::clone(&engine);
        let mut feed_rx = feed_rx.rx;
        handles.push(tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                match event {
                    FeedEvent::Item(UpstreamEvent::BookTicker(update)) => {
                        ingress_engine.process_tick(update).await;
                    }
                    FeedEvent::Item(UpstreamEvent::Depth(update)) => {
                        ingress_engine.process_depth(update);
                    }
                    FeedEvent::Reconnecting => {
                        debug!("upstream feed reconnecting");
                    }
                }
            }
        }));

        // Client channel
        let server_engine = Arc::clone(&engine);
        let server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(engine_error) = run_server(server_engine, server_shutdown).await {
                error!(?engine_error, "client channel server exited");
            }
        }));

        // Periodic workers
        let retry_rx = engine
            .take_retry_rx()
            .expect("retry receiver is taken exactly once at startup");
        handles.push(tokio::spawn(run_retry_worker(
            repository,
            retry_rx,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_daily_reset_worker(
            Arc::clone(&engine),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_funding_worker(
            Arc::clone(&engine),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_account_flusher(
            Arc::clone(&engine),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_expiry_worker(
            Arc::clone(&engine),
            shutdown_rx,
        )));

        info!("system started");
        Ok(Self {
            engine,
            shutdown_tx,
            handles,
        })
    }

    /// Run until SIGINT, then drain and exit.
    pub async fn run_until_signal(self) {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        self.shutdown().await;
    }

    /// Cooperative shutdown: stop intake, drain workers, flush dirty accounts, exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("system drained");
    }
}
