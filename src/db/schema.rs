use sqlx::PgPool;

/// 台账表结构 (幂等, 启动时执行)
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id   BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id    SERIAL PRIMARY KEY,
        email VARCHAR(255) NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        code        VARCHAR(60) PRIMARY KEY,
        name        VARCHAR(255) NOT NULL,
        unit        VARCHAR(10) NOT NULL DEFAULT 'UN',
        cost_price  NUMERIC(15, 4) NOT NULL DEFAULT 0,
        sale_price  NUMERIC(15, 4) NOT NULL DEFAULT 0,
        min_stock   NUMERIC(15, 4) NOT NULL DEFAULT 0,
        max_stock   NUMERIC(15, 4),
        category_id BIGINT REFERENCES categories (id),
        location    VARCHAR(100),
        active      BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stocks (
        product_code VARCHAR(60) PRIMARY KEY REFERENCES products (code),
        quantity     NUMERIC(15, 4) NOT NULL DEFAULT 0,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS movements (
        id           BIGSERIAL PRIMARY KEY,
        product_code VARCHAR(60) NOT NULL REFERENCES products (code),
        type         VARCHAR(10) NOT NULL CHECK (type IN ('ENTRADA', 'SAIDA')),
        quantity     NUMERIC(15, 4) NOT NULL,
        origin       VARCHAR(30),
        reference    VARCHAR(100),
        user_id      INTEGER,
        notes        TEXT,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_movements_product_code ON movements (product_code)",
    "CREATE INDEX IF NOT EXISTS idx_movements_created_at ON movements (created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS processed_nfes (
        access_key    VARCHAR(100) PRIMARY KEY,
        number        VARCHAR(20),
        supplier_name VARCHAR(255),
        total_items   INTEGER NOT NULL DEFAULT 0,
        total_value   NUMERIC(15, 2) NOT NULL DEFAULT 0,
        status        VARCHAR(20) NOT NULL DEFAULT 'PENDING',
        xml_data      BYTEA,
        processed_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// 建表 (已存在则跳过)
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Ledger schema ready ({} statements)", SCHEMA.len());
    Ok(())
}
