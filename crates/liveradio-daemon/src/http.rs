use crate::core::SessionEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, MethodRouter},
    Router,
};
use liveradio_proto::protocol::{Category, Command, RemoteIntent, SessionSnapshot};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    snapshots: watch::Receiver<SessionSnapshot>,
    categories: watch::Receiver<Vec<Category>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl HttpState {
    pub fn new(
        snapshots: watch::Receiver<SessionSnapshot>,
        categories: watch::Receiver<Vec<Category>>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            snapshots,
            categories,
            event_tx,
        }
    }
}

#[derive(Serialize)]
struct ShareInfo {
    text: String,
    link: Option<String>,
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/categories", get(get_categories))
        .route("/api/share", get(get_share))
        .route("/api/power/on", command(Command::PowerOn))
        .route("/api/power/off", command(Command::PowerOff))
        .route("/api/power/toggle", command(Command::TogglePower))
        .route("/api/stop", command(Command::Stop))
        .route("/api/resume", command(Command::Resume))
        .route("/api/next", command(Command::Next))
        .route("/api/prev", command(Command::Prev))
        .route("/api/category/next", command(Command::NextCategory))
        .route("/api/category/prev", command(Command::PrevCategory))
        .route("/api/category/:id", post(switch_category))
        .route("/api/play/:station_id", post(play_station))
        .route("/api/identify", post(identify).delete(stop_identifying))
        .route("/api/identify/clear", command(Command::ClearIdentified))
        .route("/api/remote/:intent", post(remote))
        .route("/api/reload", command(Command::ReloadCatalog))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// POST route that queues a fixed command.
fn command(cmd: Command) -> MethodRouter<HttpState> {
    post(move |State(state): State<HttpState>| async move { dispatch(&state, cmd).await })
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
        error!("Failed to queue command, session controller gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.snapshots.borrow().clone())
}

async fn get_categories(State(state): State<HttpState>) -> Json<Vec<Category>> {
    Json(state.categories.borrow().clone())
}

async fn get_share(State(state): State<HttpState>) -> Json<ShareInfo> {
    let snapshot = state.snapshots.borrow().clone();
    Json(ShareInfo {
        text: snapshot.share_text(),
        link: snapshot.share_link().map(|u| u.to_string()),
    })
}

async fn switch_category(State(state): State<HttpState>, Path(category_id): Path<String>) -> StatusCode {
    dispatch(&state, Command::SwitchCategory { category_id }).await
}

async fn play_station(State(state): State<HttpState>, Path(station_id): Path<String>) -> StatusCode {
    dispatch(&state, Command::Play { station_id }).await
}

async fn identify(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Identify).await
}

async fn stop_identifying(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::StopIdentifying).await
}

async fn remote(State(state): State<HttpState>, Path(intent): Path<String>) -> StatusCode {
    match intent.parse::<RemoteIntent>() {
        Ok(intent) => dispatch(&state, Command::Remote { intent }).await,
        Err(e) => {
            warn!("HTTP API: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use liveradio_proto::protocol::Station;
    use tower::ServiceExt;

    fn fixture() -> (
        Router,
        mpsc::Receiver<SessionEvent>,
        watch::Sender<SessionSnapshot>,
    ) {
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot::default());
        let (_cat_tx, cat_rx) = watch::channel(Vec::new());
        let (event_tx, event_rx) = mpsc::channel(8);
        (router(HttpState::new(snap_rx, cat_rx, event_tx)), event_rx, snap_tx)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_post_queues_command() {
        let (app, mut rx, _snap) = fixture();
        let resp = app.oneshot(request("POST", "/api/play/wbgo")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        match rx.recv().await {
            Some(SessionEvent::Command(Command::Play { station_id })) => assert_eq!(station_id, "wbgo"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_identify_stops_session() {
        let (app, mut rx, _snap) = fixture();
        let resp = app.oneshot(request("DELETE", "/api/identify")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(Command::StopIdentifying))
        ));
    }

    #[tokio::test]
    async fn test_remote_intent_validation() {
        let (app, mut rx, _snap) = fixture();
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/remote/rewind"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(request("POST", "/api/remote/toggle")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(Command::Remote {
                intent: RemoteIntent::TogglePlayPause
            }))
        ));
    }

    #[tokio::test]
    async fn test_closed_controller_is_unavailable() {
        let (app, rx, _snap) = fixture();
        drop(rx);
        let resp = app.oneshot(request("POST", "/api/stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_share_reflects_snapshot() {
        let (app, _rx, snap) = fixture();
        snap.send_replace(SessionSnapshot {
            rev: 4,
            current_station: Some(Station {
                id: "wbgo".into(),
                name: "WBGO Jazz 88.3".into(),
                stream_url: "https://wbgo.streamguys1.com/wbgo128".into(),
                website_url: Some("https://www.wbgo.org".into()),
                ..Station::default()
            }),
            ..SessionSnapshot::default()
        });
        let resp = app.oneshot(request("GET", "/api/share")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["text"], "Listening to WBGO Jazz 88.3 on Live Radio");
        assert_eq!(json["link"], "https://www.wbgo.org/");
    }
}
