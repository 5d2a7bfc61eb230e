mod auth;
mod config;
mod db;
mod error;
mod fileops;
mod index;
mod models;
mod routes;
mod sandbox;

use std::fs;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use auth::{AuthService, Passwords, SqliteUserStore, TokenSigner};
use config::AppConfig;
use db::{init_pool, prepare_schema};
use fileops::FileOps;
use index::IndexHandle;
use routes::register;
use sandbox::Sandbox;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct AppState {
    pub auth: AuthService,
    pub files: FileOps,
    pub index: IndexHandle,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::from_env().expect("failed to load config");

    fs::create_dir_all(&config.log_dir).expect("failed to create log directory");
    let file_appender = rolling::never(&config.log_dir, "backend.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let _guard = guard;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("failed to init logging filter");

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    if config.token_secret_is_default {
        warn!("JWT_SECRET is not set; tokens are signed with the built-in default secret");
    }

    fs::create_dir_all(&config.serve_dir)?;
    let root = fs::canonicalize(&config.serve_dir)?;

    let pool = init_pool(&config.db_path).expect("failed to init sqlite pool");
    prepare_schema(&pool)
        .await
        .expect("failed to prepare database schema");

    let auth = AuthService::new(
        SqliteUserStore::new(pool),
        TokenSigner::new(&config.token_secret),
        Passwords::default(),
    )
    .expect("failed to init auth service");
    auth.bootstrap_admin(config.admin_password.as_deref())
        .await
        .expect("failed to create default admin");

    let index = IndexHandle::start(root.clone())
        .await
        .expect("failed to build initial index");
    let files = FileOps::new(Sandbox::new(root.clone()), index.clone());

    let snapshot = index.snapshot();
    info!(
        host = %config.host,
        port = config.port,
        root = %root.display(),
        files = snapshot.total_files,
        directories = snapshot.directories.len(),
        "starting file browser backend"
    );

    let bind_addr = format!("{}:{}", config.host, config.port);
    let shared_state = web::Data::new(AppState { auth, files, index });

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(shared_state.clone())
            .configure(register)
    })
    .bind(bind_addr)?
    .run()
    .await
}
