mod sweeper;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use securechat_api::middleware::require_auth;
use securechat_api::state::{AppState, AppStateInner};
use securechat_api::{auth, files, groups, messages, moderation, reactions};
use securechat_crypto::MessageCipher;
use securechat_crypto::keys::{generate_message_key, key_from_base64};
use securechat_gateway::connection;
use securechat_gateway::Dispatcher;
use securechat_moderation::{RemoteConfig, RiskClassifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "securechat=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("SECURECHAT_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("SECURECHAT_DB_PATH").unwrap_or_else(|_| "securechat.db".into());
    let host = std::env::var("SECURECHAT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("SECURECHAT_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let uploads_dir =
        PathBuf::from(std::env::var("SECURECHAT_UPLOADS_DIR").unwrap_or_else(|_| "uploads".into()));

    // The at-rest message key. Without a configured key, stored messages
    // become unreadable on restart.
    let message_key = match std::env::var("SECURECHAT_MESSAGE_KEY") {
        Ok(encoded) => key_from_base64(&encoded)?,
        Err(_) => {
            warn!(
                "SECURECHAT_MESSAGE_KEY is not set; using an ephemeral key, \
                 existing messages will not decrypt after a restart"
            );
            generate_message_key()
        }
    };

    // Moderation backend: remote classifier when a credential is present,
    // heuristics otherwise (and as fallback either way).
    let classifier = match std::env::var("SECURECHAT_OPENAI_API_KEY") {
        Ok(api_key) if !api_key.is_empty() => {
            let mut config = RemoteConfig::new(api_key);
            if let Ok(endpoint) = std::env::var("SECURECHAT_OPENAI_ENDPOINT") {
                config.endpoint = endpoint;
            }
            if let Ok(model) = std::env::var("SECURECHAT_OPENAI_MODEL") {
                config.model = model;
            }
            info!("Moderation: remote classifier enabled ({})", config.model);
            RiskClassifier::new(Some(config))
        }
        _ => {
            info!("Moderation: heuristic classifier only");
            RiskClassifier::heuristic_only()
        }
    };

    tokio::fs::create_dir_all(&uploads_dir).await?;

    // Init database
    let db = Arc::new(securechat_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        cipher: MessageCipher::new(message_key),
        classifier,
        dispatcher,
        jwt_secret,
        uploads_dir,
    });

    tokio::spawn(sweeper::run(db));

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/uploads/{name}", get(files::download_file))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/search", get(messages::search_messages))
        // GET takes the peer's id, PATCH/DELETE the message's; the router
        // needs one capture name for all three.
        .route(
            "/messages/{id}",
            get(messages::list_conversation)
                .patch(messages::edit_message)
                .delete(messages::delete_message),
        )
        .route(
            "/messages/{id}/reactions",
            post(reactions::toggle_reaction).get(reactions::list_reactions),
        )
        .route("/files/{peer_id}", post(files::upload_file))
        .route("/moderation/analyze", post(moderation::analyze))
        .route("/groups", post(groups::create_group).get(groups::list_my_groups))
        .route(
            "/groups/{group_id}/messages",
            get(groups::list_group_messages).post(groups::send_group_message),
        )
        .route("/groups/{group_id}/members", post(groups::add_members))
        .route("/groups/{group_id}/leave", post(groups::leave_group))
        .layer(middleware::from_fn(require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("SecureChat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher.clone(),
            state.db.clone(),
            state.jwt_secret.clone(),
        )
    })
}
