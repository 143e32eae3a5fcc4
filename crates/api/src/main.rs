use giftwell_api::config::ApiConfig;

#[tokio::main]
async fn main() {
    giftwell_observability::init();

    let config = ApiConfig::from_env();

    #[cfg(feature = "postgres")]
    let state = {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            tracing::warn!("DATABASE_URL not set; using local dev default");
            "postgres://localhost/giftwell".to_string()
        });
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect_lazy(&database_url)
            .expect("invalid DATABASE_URL");
        giftwell_api::services::build_postgres_state(&config, pool)
    };

    #[cfg(not(feature = "postgres"))]
    let state = giftwell_api::services::build_in_memory_services(&config).state;

    let app = giftwell_api::app::build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
