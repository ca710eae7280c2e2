use liveradio_daemon::audio_session::CaptureRoute;
use liveradio_daemon::core::{Collaborators, SessionController, SessionEvent};
use liveradio_daemon::fingerprint::VibraFingerprinter;
use liveradio_daemon::media_controls::MediaControlsPublisher;
use liveradio_daemon::mpv::MpvEngine;
use liveradio_daemon::now_playing::{BroadcastPublisher, FanoutPublisher, NowPlayingPublisher};
use liveradio_daemon::{http, interruption, logging, socket, BroadcastMessage};
use liveradio_proto::catalog::load_catalog;
use liveradio_proto::config::Config;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can forward warnings to clients.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);
    let log_path = logging::init(broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: all external inputs funnel into the SessionController
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);

    let mut sinks: Vec<Box<dyn NowPlayingPublisher>> = vec![Box::new(BroadcastPublisher::new(
        broadcast_tx.clone(),
        config.now_playing.status_file.clone(),
    ))];
    if config.now_playing.media_controls {
        match MediaControlsPublisher::start(event_tx.clone()) {
            Ok(controls) => sinks.push(Box::new(controls)),
            Err(e) => warn!("Media controls unavailable: {}", e),
        }
    }

    let collaborators = Collaborators {
        engine: Box::new(MpvEngine::spawn(event_tx.clone(), config.mpv.default_volume)),
        now_playing: Box::new(FanoutPublisher::new(sinks)),
        fingerprinter: Box::new(VibraFingerprinter::new(
            event_tx.clone(),
            std::time::Duration::from_secs(config.identify.window_secs),
        )),
        audio_session: Box::new(CaptureRoute::new(&config.identify)),
    };
    let mut controller = SessionController::new(collaborators, config.identify.clone(), event_tx.clone());
    controller.set_catalog_source(config.catalog.clone());

    let catalog = load_catalog(&config.catalog).await;
    controller.configure(Box::new(catalog), config.playback.clone());

    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        config.daemon.port,
        controller.subscribe(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState::new(
                controller.subscribe(),
                controller.subscribe_categories(),
                event_tx.clone(),
            ),
        );
    }

    if let Err(e) = interruption::start_signal_listener(event_tx.clone()) {
        warn!("Interruption signals unavailable: {}", e);
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = shutdown_tx.send(SessionEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    controller.run(event_rx).await?;

    // Let the engine task reap mpv.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
