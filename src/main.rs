use actix_web::{middleware::Compress, App, HttpServer};
use actix_cors::Cors;
use utoipa_swagger_ui::SwaggerUi;

mod audit;
mod auth;
mod dispatch;
mod email;
mod error;
mod flush;
mod history;
mod models;
mod openapi;
mod repo;
mod resolver;
mod routes;
mod security;

use email::{EmailQueue, EmailSender, HttpEmailGateway, RecordingGateway};
use openapi::ApiDoc;
#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
use repo::inmem::InMemRepo;
use routes::{config, AppState};
use security::SecurityHeaders;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Env must come from the deployment (shell, systemd, container); .env is a
    // debug-build convenience only.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping bullhorn broadcast server");

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = InMemRepo::new();
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory repository backend");

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        info!("Using Postgres repository backend");
        repo::pg::PgRepo::new(pool)
    };

    // One gateway serves as both queue and send collaborator. Without a
    // configured gateway the recording fallback accepts everything locally.
    let (email_queue, email_sender): (Arc<dyn EmailQueue>, Arc<dyn EmailSender>) =
        if std::env::var("EMAIL_GATEWAY_URL").is_ok() {
            let gw = Arc::new(HttpEmailGateway::from_env().expect("email gateway config"));
            info!("Email gateway: HTTP ({})", std::env::var("EMAIL_GATEWAY_URL").unwrap());
            (gw.clone(), gw)
        } else {
            let gw = Arc::new(RecordingGateway::new());
            info!("Email gateway: none configured, using in-process recorder");
            (gw.clone(), gw)
        };

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let (audit, errors): (Arc<dyn audit::AuditSink>, Arc<dyn audit::ErrorSink>) = (
        Arc::new(audit::MemoryAudit::new()),
        Arc::new(audit::MemoryErrorLog::new()),
    );
    #[cfg(feature = "postgres-store")]
    let (audit, errors): (Arc<dyn audit::AuditSink>, Arc<dyn audit::ErrorSink>) = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        (
            Arc::new(audit::pg::PgAudit::new(pool.clone())),
            Arc::new(audit::pg::PgErrorLog::new(pool)),
        )
    };

    let state = AppState {
        repo: Arc::new(repo),
        email_queue,
        email_sender,
        audit,
        errors,
    };

    let openapi = ApiDoc::openapi();

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allow_any_header()
                .allowed_methods(["GET", "POST", "OPTIONS"])
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
            .app_data(actix_web::web::Data::new(state.clone()))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let mut missing = Vec::new();
    for var in ["JWT_SECRET"] {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }
    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        std::process::exit(1);
    }
    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long");
            std::process::exit(1);
        }
    }
    if env::var("EMAIL_GATEWAY_URL").is_err() {
        eprintln!("Warning: EMAIL_GATEWAY_URL not set; email escalation will be recorded locally only");
    }
}
