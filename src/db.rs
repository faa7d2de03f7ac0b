use sqlx::{postgres::PgPoolOptions, PgPool};

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects and applies the bundled schema migrations.
    pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<Self> {
        let db = Self::new(database_url).await?;
        sqlx::migrate!("./migrations").run(&db.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(db)
    }
}
